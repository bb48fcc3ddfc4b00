//! Failures the router surfaces to the application.
//!
//! The I/O layer itself never propagates errors upward: socket tasks log
//! and carry on. What reaches the caller are the failures of the routing
//! operations: an offer that collides with an existing provider, a send
//! with no route, a rejected subscription, a frame that fails validation
//! before it can be routed, and the bind/connect errors of endpoint
//! allocation.

use std::fmt;
use std::io;

use crate::{EventgroupId, InstanceId, ServiceId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The (service, instance) pair is already provided locally with a
    /// different version.
    AlreadyOffered {
        service: ServiceId,
        instance: InstanceId,
    },
    /// No local or discovered provider backs the addressed instance.
    ServiceUnavailable {
        service: ServiceId,
        instance: InstanceId,
    },
    /// The provider turned the subscription down.
    SubscriptionRejected { eventgroup: EventgroupId },
    /// An outbound frame failed validation before it could be routed.
    MalformedMessage(&'static str),
    /// Endpoint allocation failed at the socket level.
    Socket(io::Error),
    /// The configuration rules out the requested operation.
    BadConfiguration(String),
    /// The application was stopped, or was never initialized.
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyOffered { service, instance } => write!(
                f,
                "service {:04x}.{:04x} is already offered with a different version",
                service, instance
            ),
            Error::ServiceUnavailable { service, instance } => {
                write!(f, "no provider for service {:04x}.{:04x}", service, instance)
            }
            Error::SubscriptionRejected { eventgroup } => {
                write!(f, "subscription to eventgroup {:04x} was rejected", eventgroup)
            }
            Error::MalformedMessage(what) => write!(f, "malformed message: {}", what),
            Error::Socket(e) => write!(f, "socket error: {}", e),
            Error::BadConfiguration(what) => write!(f, "bad configuration: {}", what),
            Error::Stopped => write!(f, "application is stopped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Socket(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Socket(e)
    }
}
