//! Service info: everything the router knows about one (service, instance).

use crate::endpoint::EndpointDefinition;
use crate::{MajorVersion, MinorVersion, Ttl, TTL_INFINITE};

/// State of an offered or discovered service instance.
///
/// Created on a local offer or on SD discovery; removed on stop-offer, SD
/// timeout, or remote disconnect. Remote entries carry the endpoint
/// definitions the provider announced; local entries carry none (the
/// router reaches local providers through its own server endpoints).
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub major: MajorVersion,
    pub minor: MinorVersion,
    /// Remaining lifetime in seconds. `TTL_INFINITE` never ages.
    pub ttl: Ttl,
    pub reliable_endpoint: Option<EndpointDefinition>,
    pub unreliable_endpoint: Option<EndpointDefinition>,
    pub is_local: bool,
}

impl ServiceInfo {
    pub fn local(major: MajorVersion, minor: MinorVersion) -> Self {
        Self {
            major,
            minor,
            ttl: TTL_INFINITE,
            reliable_endpoint: None,
            unreliable_endpoint: None,
            is_local: true,
        }
    }

    pub fn remote(
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        reliable_endpoint: Option<EndpointDefinition>,
        unreliable_endpoint: Option<EndpointDefinition>,
    ) -> Self {
        Self {
            major,
            minor,
            ttl,
            reliable_endpoint,
            unreliable_endpoint,
            is_local: false,
        }
    }

    /// Endpoint definition for the requested transport.
    pub fn endpoint(&self, reliable: bool) -> Option<EndpointDefinition> {
        if reliable {
            self.reliable_endpoint
        } else {
            self.unreliable_endpoint
        }
    }

    /// Age the entry by `elapsed_seconds`. Returns false once the TTL is
    /// exhausted and the entry must go.
    pub fn age(&mut self, elapsed_seconds: Ttl) -> bool {
        if self.ttl == TTL_INFINITE {
            return true;
        }
        if self.ttl <= elapsed_seconds {
            self.ttl = 0;
            return false;
        }
        self.ttl -= elapsed_seconds;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_ttl_never_ages() {
        let mut info = ServiceInfo::local(1, 0);
        assert!(info.age(0xFFFF_FFFF));
        assert_eq!(info.ttl, TTL_INFINITE);
    }

    #[test]
    fn finite_ttl_expires() {
        let mut info = ServiceInfo::remote(1, 0, 10, None, None);
        assert!(info.age(4));
        assert_eq!(info.ttl, 6);
        assert!(!info.age(6));
        assert_eq!(info.ttl, 0);
    }
}
