//! # routeip
//!
//! Routing and dispatch core of a SOME/IP middleware.
//!
//! This crate implements the three pieces that carry the weight of an
//! in-vehicle service-oriented communication stack:
//!
//! - the **routing manager** ([`routing::RoutingManager`]) that tracks
//!   offered and requested services, owns the UDP/TCP endpoints, and
//!   forwards messages between the local application and remote peers,
//! - the **application runtime** ([`application::Application`]) that
//!   multiplexes user callbacks on a bounded pool of dispatcher threads
//!   with stall detection,
//! - the **server endpoints** ([`endpoint`]) that frame datagrams and
//!   byte streams into SOME/IP messages, maintain multicast group
//!   membership, and record per-client reply routes.
//!
//! Service Discovery is an external collaborator: the crate defines the
//! interface it exchanges with the router ([`sd::ServiceDiscovery`] and
//! [`sd::DiscoveryHost`]) but not the SD state machine itself.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use routeip::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> routeip::Result<()> {
//!     let config = Config::builder()
//!         .application_name("brake-monitor")
//!         .service(ServiceConfig::new(0x1234, 0x0001).unreliable_port(30501))
//!         .build();
//!
//!     let app = Application::new(config);
//!     app.init().await?;
//!
//!     app.register_message_handler(0x1234, 0x0001, 0x0421, |message| {
//!         println!("request: {:?}", message.payload);
//!     });
//!
//!     app.offer_service(0x1234, 0x0001, 1, 0).await?;
//!     app.start();
//!     app.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency model
//!
//! Socket I/O runs on the tokio executor; user handlers run on dedicated
//! dispatcher threads so a slow handler can never starve I/O. A handler
//! that overruns `max_dispatch_time` triggers an auxiliary dispatcher
//! (up to `max_dispatchers`) to keep the queue moving; see [`dispatch`].

pub mod net;

pub mod application;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod routing;
pub mod sd;

/// Wire format parsing for SOME/IP headers and messages.
/// Exposed for testing and interoperability verification.
pub mod wire;

pub use application::Application;
pub use config::{Config, ConfigBuilder, ServiceConfig};
pub use error::{Error, Result};
pub use routing::Message;

// ============================================================================
// PROTOCOL IDENTIFIERS
// ============================================================================
//
// Identifiers are plain unsigned integers, big-endian on the wire. The
// routing tables key on them directly, and the wildcard values below take
// part in lookup fallback, so they stay transparent aliases rather than
// validated newtypes.

/// Service identifier (16 bit).
pub type ServiceId = u16;
/// Service instance identifier (16 bit).
pub type InstanceId = u16;
/// Method identifier (16 bit, high bit clear).
pub type MethodId = u16;
/// Event identifier (16 bit, high bit set).
pub type EventId = u16;
/// Eventgroup identifier (16 bit).
pub type EventgroupId = u16;
/// Client identifier, unique per application process within the host.
pub type ClientId = u16;
/// Session identifier: per-client monotonic counter, wraps, never zero.
pub type SessionId = u16;
/// Major interface version (8 bit, carried in the header).
pub type MajorVersion = u8;
/// Minor interface version (32 bit, SD-only).
pub type MinorVersion = u32;
/// Time-to-live in seconds (24 bit on the wire).
pub type Ttl = u32;

/// Wildcard service id.
pub const ANY_SERVICE: ServiceId = 0xFFFF;
/// Wildcard instance id.
pub const ANY_INSTANCE: InstanceId = 0xFFFF;
/// Wildcard method id. `ANY_METHOD - 1` is reserved for the identify
/// handshake of exclusive proxies.
pub const ANY_METHOD: MethodId = 0xFFFF;
/// Wildcard event id.
pub const ANY_EVENT: EventId = 0xFFFF;
/// Wildcard major version.
pub const ANY_MAJOR: MajorVersion = 0xFF;
/// Wildcard minor version.
pub const ANY_MINOR: MinorVersion = 0xFFFF_FFFF;
/// Major version used when the application does not care.
pub const DEFAULT_MAJOR: MajorVersion = 0x00;
/// Minor version used when the application does not care.
pub const DEFAULT_MINOR: MinorVersion = 0x0000_0000;

/// Client id of an unassigned application.
pub const ILLEGAL_CLIENT: ClientId = 0x0000;

/// TTL value meaning "never expires" (24-bit all-ones).
pub const TTL_INFINITE: Ttl = 0xFF_FFFF;

// ============================================================================
// RETURN CODES
// ============================================================================

/// SOME/IP return codes (header offset 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0A,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::NotOk),
            0x02 => Some(Self::UnknownService),
            0x03 => Some(Self::UnknownMethod),
            0x04 => Some(Self::NotReady),
            0x05 => Some(Self::NotReachable),
            0x06 => Some(Self::Timeout),
            0x07 => Some(Self::WrongProtocolVersion),
            0x08 => Some(Self::WrongInterfaceVersion),
            0x09 => Some(Self::MalformedMessage),
            0x0A => Some(Self::WrongMessageType),
            _ => None,
        }
    }
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub mod prelude {
    pub use crate::application::Application;
    pub use crate::config::{Config, ServiceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::routing::Message;
    pub use crate::{
        ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MethodId, MinorVersion,
        ReturnCode, ServiceId, SessionId, Ttl,
    };
}
