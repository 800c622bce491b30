use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use rfbd::rfb::{InputEvent, RfbHandler};
use rfbd::{
    Geometry, Rect, Registry, ServerConfig, Session, Supervisor, UpdateError, DEFAULT_UPDATES,
    RFB_PORT_BASE,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The display to serve, listens on port-base + display
    #[arg(env = "RFBD_DISPLAY")]
    display: usize,

    /// Framebuffer width in pixels
    #[arg(long, env = "RFBD_WIDTH", default_value_t = 320)]
    width: u16,

    /// Framebuffer height in pixels
    #[arg(long, env = "RFBD_HEIGHT", default_value_t = 240)]
    height: u16,

    /// Number of preallocated update descriptors
    #[arg(long, env = "RFBD_UPDATES", default_value_t = DEFAULT_UPDATES)]
    updates: usize,

    /// Address to listen on
    #[arg(long, env = "RFBD_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port of display 0
    #[arg(long, env = "RFBD_PORT_BASE", default_value_t = RFB_PORT_BASE)]
    port_base: u16,

    /// Desktop name sent to clients
    #[arg(long, env = "RFBD_NAME", default_value = "rfbd")]
    name: String,

    /// Paint a moving test pattern
    #[arg(long, env = "RFBD_PATTERN")]
    pattern: bool,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const BACKGROUND: u32 = 0x0020_2020;
const COLORS: [u32; 4] = [0x00ff_4040, 0x0040_ff40, 0x0040_40ff, 0x00ff_ff40];
const BAR_WIDTH: u16 = 16;
const FRAME_INTERVAL: Duration = Duration::from_millis(40);

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = ServerConfig {
        display: cli.display,
        geometry: Geometry::new(cli.width, cli.height),
        updates: cli.updates,
        bind: cli.bind,
        port_base: cli.port_base,
        desktop_name: cli.name,
    };
    info!("Display: {}", config.display);
    info!("Geometry: {}x{}", config.geometry.width, config.geometry.height);
    info!("Updates: {}", config.updates);
    info!("Verbosity: {}", cli.verbose);

    // handle control+c
    ctrlc::set_handler(|| {
        info!("Interrupted, exiting.");
        std::process::exit(0);
    })
    .context("could not install the interrupt handler")?;

    let registry = Registry::new();
    let mut handler = RfbHandler::new(config.desktop_name.clone());
    let mut input = None;
    if cli.pattern {
        let (tx, rx) = flume::unbounded();
        handler = handler.with_input(tx);
        input = Some(rx);
    }

    let supervisor = Supervisor::start(&config, &registry, handler)
        .with_context(|| format!("display {} failed to start", config.display))?;
    let supervisor = Arc::new(supervisor);
    info!("Listening on {}", supervisor.listen_addr());

    if let Some(input) = input {
        let session = registry
            .lookup(config.display)
            .context("session missing from the registry")?;
        let driver = supervisor.clone();
        thread::Builder::new()
            .name("pattern".into())
            .spawn(move || paint_pattern(&session, driver.handler(), &input))
            .context("could not start the pattern driver")?;
    }

    supervisor.run()
}

/// Sweeps a vertical bar across the screen while a client is attached. Key
/// presses cycle the bar colour and put its value on the client's clipboard;
/// the bell rings when the cycle wraps.
fn paint_pattern(session: &Session, client: &RfbHandler, input: &flume::Receiver<InputEvent>) {
    let mut x = 0u16;
    let mut color = 0;
    loop {
        session.wait_ready();
        let fb = session.framebuffer();
        let geometry = fb.geometry();
        let bar = BAR_WIDTH.min(geometry.width);
        let span = geometry.width - bar;
        x = x.min(span);
        info!("display {}: pattern running", session.display());

        fb.fill_rect(geometry.bounds(), BACKGROUND);
        let mut damage = vec![geometry.bounds()];
        loop {
            if let Err(e) = damage.drain(..).try_for_each(|rect| session.post_update(rect)) {
                match e {
                    UpdateError::Paused => debug!("display {}: pattern paused", session.display()),
                    e => warn!("display {}: pattern update dropped: {}", session.display(), e),
                }
                break;
            }
            thread::sleep(FRAME_INTERVAL);

            for event in input.try_iter() {
                if let InputEvent::Key { down: true, .. } = event {
                    color = (color + 1) % COLORS.len();
                    let mut sent = client.send_cut_text(&format!("#{:06x}", COLORS[color]));
                    if color == 0 {
                        sent = sent.and_then(|()| client.bell());
                    }
                    if let Err(e) = sent {
                        debug!("display {}: {}", session.display(), e);
                    }
                }
            }

            let old = Rect::new(x, 0, bar, geometry.height);
            x = if x >= span { 0 } else { x.saturating_add(4).min(span) };
            let new = Rect::new(x, 0, bar, geometry.height);
            fb.fill_rect(old, BACKGROUND);
            fb.fill_rect(new, COLORS[color]);
            damage.push(old);
            damage.push(new);
        }
    }
}
