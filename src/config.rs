use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::ConfigError;
use crate::{rfb_display_port, Geometry, DEFAULT_UPDATES, RFB_MAX_DISPLAYS, RFB_PORT_BASE};

/// Settings for one display's supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub display: usize,
    pub geometry: Geometry,
    /// Preallocated update descriptors.
    pub updates: usize,
    pub bind: IpAddr,
    pub port_base: u16,
    pub desktop_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            display: 0,
            geometry: Geometry::new(320, 240),
            updates: DEFAULT_UPDATES,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_base: RFB_PORT_BASE,
            desktop_name: String::from("rfbd"),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.display >= RFB_MAX_DISPLAYS {
            return Err(ConfigError::DisplayOutOfRange {
                display: self.display,
                max: RFB_MAX_DISPLAYS,
            });
        }
        if self.updates == 0 {
            return Err(ConfigError::NoUpdates);
        }
        if self.geometry.width == 0 || self.geometry.height == 0 {
            return Err(ConfigError::Geometry(self.geometry.width, self.geometry.height));
        }
        self.listen_addr().map(|_| ())
    }

    /// `bind:port_base+display`
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let port = rfb_display_port(self.port_base, self.display).ok_or(ConfigError::Port {
            base: self.port_base,
            display: self.display,
        })?;
        Ok(SocketAddr::new(self.bind, port))
    }
}
