//! # Service Discovery Interface
//!
//! The SD state machine (offer cycles, find repetition, subscription
//! renewal timing) is an external collaborator. This module defines the
//! two narrow interfaces it exchanges with the routing manager:
//!
//! - [`ServiceDiscovery`]: what the router drives. Include a service in
//!   the next offer cycle, find a remote service, initiate or withdraw a
//!   remote subscription.
//! - [`DiscoveryHost`]: what SD calls back on the router. Learned and
//!   expired routing info, remote subscription requests and their
//!   acknowledgements, periodic aging.
//!
//! [`NullDiscovery`] no-ops every call; tests and discovery-less setups
//! inject it.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::endpoint::EndpointDefinition;
use crate::{ClientId, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};

/// Interface the routing manager drives on the SD collaborator.
pub trait ServiceDiscovery: Send + Sync {
    /// Include the service in the next Offer cycle.
    fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    );

    /// Withdraw the service (StopOffer).
    fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    );

    /// Start finding the service on behalf of a local request.
    fn request_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    );

    /// Stop finding the service.
    fn release_service(&self, service: ServiceId, instance: InstanceId);

    /// Initiate a remote eventgroup subscription.
    fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
        client: ClientId,
    );

    /// Withdraw a remote eventgroup subscription.
    fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
    );

    /// An SD message arrived on one of the router's endpoints.
    fn on_message(&self, _data: &[u8], _from_multicast: bool) {}
}

/// Interface the SD collaborator calls back on the routing manager.
pub trait DiscoveryHost: Send + Sync {
    /// A remote offer was learned (or refreshed).
    #[allow(clippy::too_many_arguments)]
    fn add_routing_info(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
    );

    /// A remote offer was withdrawn or has expired.
    fn del_routing_info(
        &self,
        service: ServiceId,
        instance: InstanceId,
        has_reliable: bool,
        has_unreliable: bool,
    );

    /// Age all SD-derived entries by `elapsed`, delete the exhausted ones,
    /// and return the smallest remaining TTL (None with no finite entry).
    fn update_routing_info(&self, elapsed: Duration) -> Option<Duration>;

    /// A remote peer subscribes to an eventgroup we provide. Returns true
    /// if the subscription was accepted.
    fn on_remote_subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: EndpointDefinition,
        expiration: Instant,
    ) -> bool;

    /// A remote peer unsubscribes.
    fn on_remote_unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: &EndpointDefinition,
    );

    /// The provider acknowledged our subscription.
    fn on_subscribe_ack(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    );

    /// The provider rejected our subscription.
    fn on_subscribe_nack(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    );

    /// Evict expired subscribers everywhere; returns the next deadline.
    fn expire_subscriptions(&self) -> Option<Instant>;

    /// A peer went away: drop its subscriptions.
    fn expire_subscriptions_of(&self, address: IpAddr);

    /// A peer went away: drop the services it offered.
    fn expire_services_of(&self, address: IpAddr);
}

/// Discovery collaborator that does nothing. Useful for tests and for
/// statically configured deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiscovery;

impl ServiceDiscovery for NullDiscovery {
    fn offer_service(&self, _: ServiceId, _: InstanceId, _: MajorVersion, _: MinorVersion) {}
    fn stop_offer_service(&self, _: ServiceId, _: InstanceId, _: MajorVersion, _: MinorVersion) {}
    fn request_service(&self, _: ServiceId, _: InstanceId, _: MajorVersion, _: MinorVersion) {}
    fn release_service(&self, _: ServiceId, _: InstanceId) {}
    fn subscribe(&self, _: ServiceId, _: InstanceId, _: EventgroupId, _: MajorVersion, _: Ttl, _: ClientId) {}
    fn unsubscribe(&self, _: ServiceId, _: InstanceId, _: EventgroupId, _: ClientId) {}
}
