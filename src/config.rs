//! # Application Configuration
//!
//! Configuration for a routeip application: identity, dispatcher limits,
//! and the port layout of offered services.
//!
//! Loading configuration from files is the job of an external collaborator;
//! this module only records the configured values and applies the standard
//! environment overrides.
//!
//! ## Builder Pattern
//!
//! ```
//! use routeip::{Config, ServiceConfig};
//! use std::time::Duration;
//!
//! let config = Config::builder()
//!     .application_name("brake-monitor")
//!     .client_id(0x0043)
//!     .max_dispatchers(4)
//!     .max_dispatch_time(Duration::from_millis(100))
//!     .service(
//!         ServiceConfig::new(0x1234, 0x0001)
//!             .reliable_port(30501)
//!             .unreliable_port(30502),
//!     )
//!     .build();
//! assert_eq!(config.application_name, "brake-monitor");
//! ```
//!
//! ## Configuration Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `application_name` | `""` | Name of this application |
//! | `client_id` | auto from name hash | 16-bit client identifier |
//! | `routing_host` | `None` | Name of the routing-manager host application |
//! | `unicast` | `127.0.0.1` | Outbound unicast interface address |
//! | `max_dispatchers` | 2 + main | Auxiliary dispatcher thread limit |
//! | `max_dispatch_time` | 100 ms | Per-handler stall threshold |
//! | `max_message_size` | 1400 | Largest UDP datagram accepted/sent |
//! | `services` | empty | Per-service endpoint port layout |
//!
//! ## Environment Overrides
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `ROUTEIP_APPLICATION` | `application_name` |
//! | `ROUTEIP_CONFIGURATION` | `configuration_path` (recorded, not parsed here) |
//! | `ROUTEIP_ROUTING` | `routing_host` |

use std::net::IpAddr;
use std::time::Duration;

use crate::{InstanceId, ServiceId};

/// Environment variable overriding the application name.
pub const ENV_APPLICATION: &str = "ROUTEIP_APPLICATION";
/// Environment variable pointing at the configuration file or folder.
pub const ENV_CONFIGURATION: &str = "ROUTEIP_CONFIGURATION";
/// Environment variable naming the routing-manager host application.
pub const ENV_ROUTING: &str = "ROUTEIP_ROUTING";

/// Largest UDP payload without jumbo frames.
pub const DEFAULT_MAX_UDP_MESSAGE_SIZE: usize = 1400;

/// Default auxiliary dispatcher count (the main dispatcher is extra).
pub const DEFAULT_MAX_DISPATCHERS: usize = 2;

/// Default per-handler stall threshold.
pub const DEFAULT_MAX_DISPATCH_TIME: Duration = Duration::from_millis(100);

/// Endpoint port layout for one offered service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: ServiceId,
    pub instance: InstanceId,
    /// TCP port the service is offered on, if any.
    pub reliable_port: Option<u16>,
    /// UDP port the service is offered on, if any.
    pub unreliable_port: Option<u16>,
    /// Multicast address and port used to notify eventgroup subscribers.
    pub multicast: Option<(IpAddr, u16)>,
}

impl ServiceConfig {
    pub fn new(service: ServiceId, instance: InstanceId) -> Self {
        Self {
            service,
            instance,
            reliable_port: None,
            unreliable_port: None,
            multicast: None,
        }
    }

    /// Offer the service over TCP on this port.
    pub fn reliable_port(mut self, port: u16) -> Self {
        self.reliable_port = Some(port);
        self
    }

    /// Offer the service over UDP on this port.
    pub fn unreliable_port(mut self, port: u16) -> Self {
        self.unreliable_port = Some(port);
        self
    }

    /// Notify subscribers of this service via the given multicast group.
    pub fn multicast(mut self, address: IpAddr, port: u16) -> Self {
        self.multicast = Some((address, port));
        self
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of this application.
    pub application_name: String,
    /// Client identifier. Zero picks one derived from the name.
    pub client_id: u16,
    /// Name of the routing-manager host application, if configured.
    pub routing_host: Option<String>,
    /// Path to the configuration file or folder (recorded for collaborators).
    pub configuration_path: Option<String>,
    /// Local unicast interface address used for binding and multicast sends.
    pub unicast: IpAddr,
    /// Auxiliary dispatcher thread limit (main dispatcher not included).
    pub max_dispatchers: usize,
    /// Per-handler stall threshold before an auxiliary dispatcher is spawned.
    pub max_dispatch_time: Duration,
    /// Largest UDP datagram accepted or sent.
    pub max_message_size: usize,
    /// Per-service endpoint port layout.
    pub services: Vec<ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_name: String::new(),
            client_id: 0,
            routing_host: None,
            configuration_path: None,
            unicast: IpAddr::from([127, 0, 0, 1]),
            max_dispatchers: DEFAULT_MAX_DISPATCHERS,
            max_dispatch_time: DEFAULT_MAX_DISPATCH_TIME,
            max_message_size: DEFAULT_MAX_UDP_MESSAGE_SIZE,
            services: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Apply the standard environment overrides to this configuration.
    pub fn apply_env(mut self) -> Self {
        if let Ok(name) = std::env::var(ENV_APPLICATION) {
            if !name.is_empty() {
                self.application_name = name;
            }
        }
        if let Ok(path) = std::env::var(ENV_CONFIGURATION) {
            if !path.is_empty() {
                self.configuration_path = Some(path);
            }
        }
        if let Ok(host) = std::env::var(ENV_ROUTING) {
            if !host.is_empty() {
                self.routing_host = Some(host);
            }
        }
        self
    }

    /// Effective client id: the configured one, or one derived from the
    /// application name if the configuration left it at zero.
    pub fn effective_client_id(&self) -> u16 {
        if self.client_id != 0 {
            return self.client_id;
        }
        // FNV-1a over the name, folded to 16 bit, zero avoided.
        let mut hash: u32 = 0x811c_9dc5;
        for byte in self.application_name.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let folded = ((hash >> 16) ^ hash) as u16;
        if folded == 0 {
            1
        } else {
            folded
        }
    }

    /// Whether this application is the routing-manager host. With no
    /// routing host configured the application hosts the router itself.
    pub fn is_routing_host(&self) -> bool {
        match &self.routing_host {
            Some(host) => *host == self.application_name,
            None => true,
        }
    }

    /// Look up the port layout for a service instance.
    pub fn find_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.service == service && s.instance == instance)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the application name
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Set the client identifier
    pub fn client_id(mut self, client: u16) -> Self {
        self.config.client_id = client;
        self
    }

    /// Name the routing-manager host application
    pub fn routing_host(mut self, host: impl Into<String>) -> Self {
        self.config.routing_host = Some(host.into());
        self
    }

    /// Set the local unicast interface address
    pub fn unicast(mut self, address: IpAddr) -> Self {
        self.config.unicast = address;
        self
    }

    /// Set the auxiliary dispatcher limit
    pub fn max_dispatchers(mut self, count: usize) -> Self {
        self.config.max_dispatchers = count;
        self
    }

    /// Set the per-handler stall threshold
    pub fn max_dispatch_time(mut self, time: Duration) -> Self {
        self.config.max_dispatch_time = time;
        self
    }

    /// Set the largest accepted UDP datagram size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Add a service port layout entry
    pub fn service(mut self, service: ServiceConfig) -> Self {
        self.config.services.push(service);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_derived_from_name_is_stable_and_nonzero() {
        let a = Config::builder().application_name("brake-monitor").build();
        let b = Config::builder().application_name("brake-monitor").build();
        assert_eq!(a.effective_client_id(), b.effective_client_id());
        assert_ne!(a.effective_client_id(), 0);
    }

    #[test]
    fn configured_client_id_wins() {
        let config = Config::builder()
            .application_name("x")
            .client_id(0x1234)
            .build();
        assert_eq!(config.effective_client_id(), 0x1234);
    }

    #[test]
    fn routing_host_defaults_to_self() {
        let config = Config::builder().application_name("a").build();
        assert!(config.is_routing_host());

        let config = Config::builder()
            .application_name("a")
            .routing_host("b")
            .build();
        assert!(!config.is_routing_host());
    }

    #[test]
    fn service_lookup() {
        let config = Config::builder()
            .service(ServiceConfig::new(0x1234, 0x0001).unreliable_port(30501))
            .build();
        assert!(config.find_service(0x1234, 0x0001).is_some());
        assert!(config.find_service(0x1234, 0x0002).is_none());
    }
}
