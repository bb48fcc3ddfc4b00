//! The routing manager: service tables, endpoint ownership, and message
//! forwarding between the local application and remote peers.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::endpoint::{
    Destination, EndpointDefinition, EndpointHost, EndpointId, Target, TcpClientEndpoint,
    TcpServerEndpoint, UdpClientEndpoint, UdpServerEndpoint,
};
use crate::net::{TcpListener, UdpSocket};
use crate::sd::{DiscoveryHost, ServiceDiscovery};
use crate::wire::{self, Header, MessageType};
use crate::{
    ClientId, Error, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, Result,
    ReturnCode, ServiceId, Ttl, ANY_MAJOR, TTL_INFINITE,
};

use super::registry::EventRegistry;
use super::service::ServiceInfo;
use super::Message;

// ============================================================================
// HOST INTERFACE
// ============================================================================

/// Registration state of the application toward the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Deregistered,
}

/// Capability set the router needs from the application runtime.
pub trait RoutingHost: Send + Sync {
    /// Deliver a message for dispatch to the application's handlers.
    fn on_message(&self, message: Message);

    /// A service became available or unavailable.
    fn on_availability(
        &self,
        service: ServiceId,
        instance: InstanceId,
        available: bool,
        major: MajorVersion,
        minor: MinorVersion,
    );

    /// Registration state changed.
    fn on_state(&self, state: RegistrationState);

    /// A subscriber arrived or left an eventgroup we provide. The return
    /// value accepts or rejects the subscription.
    fn on_subscription(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
        subscribed: bool,
    ) -> bool;

    /// Our own subscription attempt failed.
    fn on_subscription_error(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        error: u16,
    );
}

/// Subscription progress for one (service, instance, eventgroup, client).
/// Absence from the table is the idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Acknowledged,
    Nacked,
}

/// Subscription NACK error code reported to the application.
const SUBSCRIPTION_REJECTED: u16 = 0x0007;

// ============================================================================
// TABLES
// ============================================================================

#[derive(Default)]
struct ServiceTables {
    /// Local providers; invariant: at most one per (service, instance).
    local: HashMap<(ServiceId, InstanceId), ServiceInfo>,
    /// Remote providers learned from SD.
    remote: HashMap<(ServiceId, InstanceId), ServiceInfo>,
}

enum ServerEndpointHandle<U: UdpSocket, L: TcpListener> {
    Udp(Arc<UdpServerEndpoint<U>>),
    Tcp(Arc<TcpServerEndpoint<L>>),
}

impl<U: UdpSocket, L: TcpListener> Clone for ServerEndpointHandle<U, L> {
    fn clone(&self) -> Self {
        match self {
            Self::Udp(endpoint) => Self::Udp(Arc::clone(endpoint)),
            Self::Tcp(endpoint) => Self::Tcp(Arc::clone(endpoint)),
        }
    }
}

impl<U: UdpSocket, L: TcpListener> ServerEndpointHandle<U, L> {
    fn id(&self) -> EndpointId {
        match self {
            Self::Udp(endpoint) => endpoint.id(),
            Self::Tcp(endpoint) => endpoint.id(),
        }
    }

    fn send(&self, data: &[u8], flush: bool) -> bool {
        match self {
            Self::Udp(endpoint) => endpoint.send(data, flush),
            Self::Tcp(endpoint) => endpoint.send(data, flush),
        }
    }

    fn send_to(&self, target: &EndpointDefinition, data: &[u8], flush: bool) -> bool {
        match self {
            Self::Udp(endpoint) => endpoint.send_to(target, data, flush),
            Self::Tcp(endpoint) => endpoint.send_to(target, data, flush),
        }
    }

    fn get_client(&self, target: &EndpointDefinition) -> ClientId {
        match self {
            Self::Udp(endpoint) => endpoint.get_client(target),
            Self::Tcp(endpoint) => endpoint.get_client(target),
        }
    }

    fn stop(&self) {
        match self {
            Self::Udp(endpoint) => endpoint.stop(),
            Self::Tcp(endpoint) => endpoint.stop(),
        }
    }
}

enum ClientEndpointHandle<U: UdpSocket, L: TcpListener> {
    Udp(Arc<UdpClientEndpoint<U>>),
    Tcp(Arc<TcpClientEndpoint<L::Stream>>),
}

impl<U: UdpSocket, L: TcpListener> Clone for ClientEndpointHandle<U, L> {
    fn clone(&self) -> Self {
        match self {
            Self::Udp(endpoint) => Self::Udp(Arc::clone(endpoint)),
            Self::Tcp(endpoint) => Self::Tcp(Arc::clone(endpoint)),
        }
    }
}

impl<U: UdpSocket, L: TcpListener> ClientEndpointHandle<U, L> {
    fn id(&self) -> EndpointId {
        match self {
            Self::Udp(endpoint) => endpoint.id(),
            Self::Tcp(endpoint) => endpoint.id(),
        }
    }

    fn send(&self, data: &[u8], flush: bool) -> bool {
        match self {
            Self::Udp(endpoint) => endpoint.send(data, flush),
            Self::Tcp(endpoint) => endpoint.send(data, flush),
        }
    }

    fn stop(&self) {
        match self {
            Self::Udp(endpoint) => endpoint.stop(),
            Self::Tcp(endpoint) => endpoint.stop(),
        }
    }
}

struct EndpointTables<U: UdpSocket, L: TcpListener> {
    /// Server endpoints; invariant: at most one per (port, reliable).
    server: HashMap<(u16, bool), ServerEndpointHandle<U, L>>,
    /// Which instance a service reaches through which endpoint.
    service_instances: HashMap<ServiceId, HashMap<EndpointId, InstanceId>>,
    /// Client endpoints; invariant: at most one per
    /// (address, port, reliable, owning client).
    client: HashMap<(IpAddr, u16, bool, ClientId), ClientEndpointHandle<U, L>>,
    /// Local ports bound by client endpoints, per transport.
    used_client_ports: HashMap<bool, HashSet<u16>>,
}

impl<U: UdpSocket, L: TcpListener> Default for EndpointTables<U, L> {
    fn default() -> Self {
        Self {
            server: HashMap::new(),
            service_instances: HashMap::new(),
            client: HashMap::new(),
            used_client_ports: HashMap::new(),
        }
    }
}

type RequestedServices =
    HashMap<ClientId, HashMap<ServiceId, HashMap<InstanceId, HashSet<(MajorVersion, MinorVersion)>>>>;

// ============================================================================
// ROUTING MANAGER
// ============================================================================

/// The central router of the process.
///
/// Owns the server and client endpoints strongly through its tables;
/// endpoints refer back only weakly. Lock order is the declaration order
/// of the table mutexes (services, endpoints, requested, then the leaf
/// tables); host and discovery callbacks are always invoked with no table
/// lock held.
pub struct RoutingManager<U: UdpSocket = tokio::net::UdpSocket, L: TcpListener = tokio::net::TcpListener>
{
    client: ClientId,
    config: Config,
    host: Weak<dyn RoutingHost>,
    discovery: Mutex<Arc<dyn ServiceDiscovery>>,
    registry: EventRegistry,
    services: Mutex<ServiceTables>,
    endpoints: Mutex<EndpointTables<U, L>>,
    requested: Mutex<RequestedServices>,
    remote_subscribers:
        Mutex<HashMap<(ServiceId, InstanceId, ClientId), HashSet<EndpointDefinition>>>,
    identified_clients: Mutex<HashMap<(ServiceId, InstanceId, bool), HashSet<ClientId>>>,
    subscription_state:
        Mutex<HashMap<(ServiceId, InstanceId, EventgroupId, ClientId), SubscriptionState>>,
}

impl<U: UdpSocket, L: TcpListener> RoutingManager<U, L> {
    pub fn new(config: Config, client: ClientId, host: Weak<dyn RoutingHost>) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            host,
            discovery: Mutex::new(Arc::new(crate::sd::NullDiscovery)),
            registry: EventRegistry::new(),
            services: Mutex::new(ServiceTables::default()),
            endpoints: Mutex::new(EndpointTables::default()),
            requested: Mutex::new(HashMap::new()),
            remote_subscribers: Mutex::new(HashMap::new()),
            identified_clients: Mutex::new(HashMap::new()),
            subscription_state: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Install the SD collaborator.
    pub fn set_discovery(&self, discovery: Arc<dyn ServiceDiscovery>) {
        *self.discovery.lock().expect("discovery slot poisoned") = discovery;
    }

    /// Mark the application registered. The routing host registers against
    /// itself, so this succeeds immediately.
    pub fn start(&self) {
        if let Some(host) = self.host.upgrade() {
            host.on_state(RegistrationState::Registered);
        }
    }

    /// Tear down every endpoint and deregister the application.
    pub fn stop(&self) {
        let (server, client) = {
            let mut endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
            let server: Vec<_> = endpoints.server.drain().map(|(_, e)| e).collect();
            let client: Vec<_> = endpoints.client.drain().map(|(_, e)| e).collect();
            endpoints.service_instances.clear();
            endpoints.used_client_ports.clear();
            (server, client)
        };
        for endpoint in &server {
            endpoint.stop();
        }
        for endpoint in &client {
            endpoint.stop();
        }
        if let Some(host) = self.host.upgrade() {
            host.on_state(RegistrationState::Deregistered);
        }
    }

    fn host(&self) -> Option<Arc<dyn RoutingHost>> {
        self.host.upgrade()
    }

    fn discovery(&self) -> Arc<dyn ServiceDiscovery> {
        Arc::clone(&self.discovery.lock().expect("discovery slot poisoned"))
    }

    fn endpoint_host(self: &Arc<Self>) -> Weak<dyn EndpointHost> {
        let strong: Arc<dyn EndpointHost> = Arc::clone(self) as Arc<dyn EndpointHost>;
        Arc::downgrade(&strong)
    }

    // ------------------------------------------------------------------
    // Offer / request
    // ------------------------------------------------------------------

    /// Register a local provider. Idempotent for an identical version;
    /// a differing version fails with [`Error::AlreadyOffered`]. Server
    /// endpoints for the configured ports are allocated and SD is told to
    /// include the service in its next Offer cycle.
    pub async fn offer_service(
        self: &Arc<Self>,
        _client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        {
            let mut services = self.services.lock().expect("service tables poisoned");
            if let Some(existing) = services.local.get(&(service, instance)) {
                if existing.major == major && existing.minor == minor {
                    return Ok(());
                }
                return Err(Error::AlreadyOffered { service, instance });
            }
            services
                .local
                .insert((service, instance), ServiceInfo::local(major, minor));
        }

        if let Some(layout) = self.config.find_service(service, instance).cloned() {
            if let Some(port) = layout.unreliable_port {
                let endpoint = self.find_or_create_server_endpoint(port, false).await?;
                self.map_service_instance(service, endpoint.id(), instance);
            }
            if let Some(port) = layout.reliable_port {
                let endpoint = self.find_or_create_server_endpoint(port, true).await?;
                self.map_service_instance(service, endpoint.id(), instance);
            }
        }

        self.discovery().offer_service(service, instance, major, minor);
        if let Some(host) = self.host() {
            host.on_availability(service, instance, true, major, minor);
        }
        Ok(())
    }

    /// Remove a local provider, tear down server endpoints no longer
    /// backing any offered service, and withdraw the offer from SD.
    pub fn stop_offer_service(
        &self,
        _client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let removed = {
            let mut services = self.services.lock().expect("service tables poisoned");
            match services.local.get(&(service, instance)) {
                Some(info) if info.major == major && info.minor == minor => {
                    services.local.remove(&(service, instance))
                }
                Some(_) => {
                    tracing::warn!(
                        "stop_offer_service {:04x}.{:04x}: version mismatch, ignoring",
                        service,
                        instance
                    );
                    None
                }
                None => None,
            }
        };
        if removed.is_none() {
            return;
        }

        self.teardown_unused_server_endpoints();

        self.discovery()
            .stop_offer_service(service, instance, major, minor);
        if let Some(host) = self.host() {
            host.on_availability(service, instance, false, major, minor);
        }
    }

    /// Record a client's demand for a service and ask SD to find it. With
    /// `use_exclusive_proxy` the client is tracked for per-client endpoint
    /// identification (the identify handshake on `ANY_METHOD - 1`).
    pub fn request_service(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        use_exclusive_proxy: bool,
    ) {
        self.requested
            .lock()
            .expect("request table poisoned")
            .entry(client)
            .or_default()
            .entry(service)
            .or_default()
            .entry(instance)
            .or_default()
            .insert((major, minor));

        if use_exclusive_proxy {
            let mut identified = self
                .identified_clients
                .lock()
                .expect("identified table poisoned");
            identified.entry((service, instance, false)).or_default();
            identified.entry((service, instance, true)).or_default();
        }

        self.discovery().request_service(service, instance, major, minor);

        // Already available locally or via SD? Report right away.
        let known = {
            let services = self.services.lock().expect("service tables poisoned");
            services
                .local
                .get(&(service, instance))
                .or_else(|| services.remote.get(&(service, instance)))
                .map(|info| (info.major, info.minor))
        };
        if let Some((known_major, known_minor)) = known {
            if let Some(host) = self.host() {
                host.on_availability(service, instance, true, known_major, known_minor);
            }
        }
    }

    /// Withdraw a client's demand and drop its exclusive endpoints.
    pub fn release_service(&self, client: ClientId, service: ServiceId, instance: InstanceId) {
        let mut requested = self.requested.lock().expect("request table poisoned");
        if let Some(by_service) = requested.get_mut(&client) {
            if let Some(by_instance) = by_service.get_mut(&service) {
                by_instance.remove(&instance);
                if by_instance.is_empty() {
                    by_service.remove(&service);
                }
            }
            if by_service.is_empty() {
                requested.remove(&client);
            }
        }
        drop(requested);

        self.clear_client_endpoints_of(client);
        self.discovery().release_service(service, instance);
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    /// Record the client's interest in an eventgroup. A local provider
    /// accepts (or rejects) directly and replays cached field values; a
    /// remote provider is subscribed through SD.
    pub async fn subscribe(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    ) -> Result<()> {
        let is_local = {
            let services = self.services.lock().expect("service tables poisoned");
            services.local.contains_key(&(service, instance))
        };

        if is_local {
            let accepted = self
                .host()
                .map(|host| host.on_subscription(service, instance, eventgroup, client, true))
                .unwrap_or(false);
            if !accepted {
                self.set_subscription_state(
                    service,
                    instance,
                    eventgroup,
                    client,
                    SubscriptionState::Nacked,
                );
                if let Some(host) = self.host() {
                    host.on_subscription_error(service, instance, eventgroup, SUBSCRIPTION_REJECTED);
                }
                return Err(Error::SubscriptionRejected { eventgroup });
            }

            self.registry
                .ensure_eventgroup(service, instance, eventgroup, major, TTL_INFINITE);
            self.registry
                .with_eventgroup(service, instance, eventgroup, |group| {
                    group.add_local_client(client);
                });
            self.set_subscription_state(
                service,
                instance,
                eventgroup,
                client,
                SubscriptionState::Acknowledged,
            );

            // Replay cached field values to the new subscriber, marked
            // initial, before any further update can be observed.
            for (event, payload) in self.registry.cached_fields(service, instance, eventgroup) {
                self.notify_one(service, instance, event, payload, client, true);
            }
            return Ok(());
        }

        self.set_subscription_state(
            service,
            instance,
            eventgroup,
            client,
            SubscriptionState::Pending,
        );

        // Consumer side of a multicast eventgroup: the group's datagrams
        // arrive on the configured multicast port.
        if let Some((IpAddr::V4(group_addr), group_port)) = self
            .config
            .find_service(service, instance)
            .and_then(|layout| layout.multicast)
        {
            let endpoint = self.find_or_create_server_endpoint(group_port, false).await?;
            self.map_service_instance(service, endpoint.id(), instance);
            if let ServerEndpointHandle::Udp(udp) = &endpoint {
                udp.join(group_addr).await;
            }
        }

        self.discovery()
            .subscribe(service, instance, eventgroup, major, TTL_INFINITE, client);
        Ok(())
    }

    /// Withdraw the client's interest in an eventgroup.
    pub fn unsubscribe(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.subscription_state
            .lock()
            .expect("subscription table poisoned")
            .remove(&(service, instance, eventgroup, client));

        let is_local = {
            let services = self.services.lock().expect("service tables poisoned");
            services.local.contains_key(&(service, instance))
        };
        if is_local {
            self.registry
                .with_eventgroup(service, instance, eventgroup, |group| {
                    group.remove_local_client(client);
                });
            if let Some(host) = self.host() {
                host.on_subscription(service, instance, eventgroup, client, false);
            }
        } else {
            self.discovery().unsubscribe(service, instance, eventgroup, client);
        }
    }

    /// Subscription progress as seen by the router.
    pub fn subscription_state(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
    ) -> Option<SubscriptionState> {
        self.subscription_state
            .lock()
            .expect("subscription table poisoned")
            .get(&(service, instance, eventgroup, client))
            .copied()
    }

    fn set_subscription_state(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
        state: SubscriptionState,
    ) {
        self.subscription_state
            .lock()
            .expect("subscription table poisoned")
            .insert((service, instance, eventgroup, client), state);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Route an already-serialized message. Requests go to the provider
    /// (local dispatch or a client endpoint created on demand); responses
    /// go back through the reply route their request recorded. Session-id
    /// numbering is the caller's responsibility.
    pub async fn send(
        self: &Arc<Self>,
        client: ClientId,
        data: &[u8],
        instance: InstanceId,
        flush: bool,
        reliable: bool,
    ) -> Result<()> {
        if data.len() < Header::SIZE {
            return Err(Error::MalformedMessage("shorter than a SOME/IP header"));
        }
        let service = wire::peek_service(data).expect("length checked above");
        let message_type = data[wire::MESSAGE_TYPE_POS];

        match MessageType::from_u8(message_type) {
            Some(MessageType::Request) | Some(MessageType::RequestNoReturn) => {
                let is_local = {
                    let services = self.services.lock().expect("service tables poisoned");
                    services.local.contains_key(&(service, instance))
                };
                if is_local {
                    if let Some(message) = Message::from_wire(data, instance, reliable) {
                        if let Some(host) = self.host() {
                            host.on_message(message);
                        }
                    }
                    return Ok(());
                }

                let endpoint_def = {
                    let services = self.services.lock().expect("service tables poisoned");
                    services
                        .remote
                        .get(&(service, instance))
                        .and_then(|info| info.endpoint(reliable))
                };
                let Some(endpoint_def) = endpoint_def else {
                    return Err(Error::ServiceUnavailable { service, instance });
                };
                let endpoint = self
                    .find_or_create_client_endpoint(endpoint_def, client, service, instance)
                    .await?;
                if endpoint.send(data, flush) {
                    Ok(())
                } else {
                    Err(Error::ServiceUnavailable { service, instance })
                }
            }
            Some(MessageType::Response) | Some(MessageType::Error) => {
                // The requester was recorded by the server endpoint that
                // received the request; without one the requester is local.
                if let Some(endpoint) = self.server_endpoint_for(service, instance, reliable) {
                    if endpoint.send(data, flush) {
                        return Ok(());
                    }
                }
                if let Some(message) = Message::from_wire(data, instance, reliable) {
                    if let Some(host) = self.host() {
                        host.on_message(message);
                        return Ok(());
                    }
                }
                Err(Error::ServiceUnavailable { service, instance })
            }
            Some(MessageType::Notification) => {
                let Some(message) = Message::from_wire(data, instance, reliable) else {
                    return Err(Error::MalformedMessage("unparseable notification"));
                };
                self.notify(service, instance, message.method, message.payload);
                Ok(())
            }
            _ => Err(Error::MalformedMessage("unroutable message type")),
        }
    }

    /// Publish an event: cache the value for fields, then deliver to the
    /// local subscriber set and to every remote subscriber of each group
    /// the event belongs to (multicast when the group has one configured).
    pub fn notify(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    ) {
        if self
            .registry
            .with_event(service, instance, event, |_| ())
            .is_none()
        {
            tracing::warn!(
                "notify for unregistered event {:04x}.{:04x}/{:04x}",
                service,
                instance,
                event
            );
            return;
        }
        self.registry
            .set_payload(service, instance, event, payload.clone());

        let message = Message::notification(service, instance, event).with_payload(payload);
        let wire_bytes = message.to_wire();

        let mut delivered_locally = false;
        for eventgroup in self.registry.groups_of_event(service, instance, event) {
            let (local_clients, targets, multicast) = match self.registry.with_eventgroup(
                service,
                instance,
                eventgroup,
                |group| {
                    (
                        group.local_clients().collect::<Vec<_>>(),
                        group.targets().to_vec(),
                        group.multicast,
                    )
                },
            ) {
                Some(snapshot) => snapshot,
                None => continue,
            };

            if !delivered_locally && !local_clients.is_empty() {
                delivered_locally = true;
                if let Some(host) = self.host() {
                    host.on_message(message.clone());
                }
            }

            if targets.is_empty() {
                continue;
            }
            match multicast {
                Some((address, port)) => {
                    let group_target = EndpointDefinition::new(address, port, false);
                    if let Some(endpoint) = self.server_endpoint_for(service, instance, false) {
                        endpoint.send_to(&group_target, &wire_bytes, true);
                    }
                }
                None => {
                    for target in targets {
                        let reliable = target.endpoint.reliable;
                        if let Some(endpoint) =
                            self.server_endpoint_for(service, instance, reliable)
                        {
                            endpoint.send_to(&target.endpoint, &wire_bytes, true);
                        }
                    }
                }
            }
        }
    }

    /// Targeted notification to a single subscriber. With `initial` set
    /// the message carries the replayed-cached-value marker.
    pub fn notify_one(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        client: ClientId,
        initial: bool,
    ) {
        if client == self.client {
            let mut message = Message::notification(service, instance, event).with_payload(payload);
            message.initial = initial;
            if let Some(host) = self.host() {
                host.on_message(message);
            }
            return;
        }

        let targets = {
            let subscribers = self
                .remote_subscribers
                .lock()
                .expect("remote subscriber table poisoned");
            subscribers
                .get(&(service, instance, client))
                .cloned()
                .unwrap_or_default()
        };
        if targets.is_empty() {
            tracing::warn!(
                "notify_one: no subscriber route for client {:04x} on {:04x}.{:04x}",
                client,
                service,
                instance
            );
            return;
        }
        let wire_bytes = Message::notification(service, instance, event)
            .with_payload(payload)
            .to_wire();
        for target in targets {
            if let Some(endpoint) = self.server_endpoint_for(service, instance, target.reliable) {
                endpoint.send_to(&target, &wire_bytes, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Identify handshake bookkeeping
    // ------------------------------------------------------------------

    /// A client answered the identify request on one of its endpoints.
    pub fn on_identify_response(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        reliable: bool,
    ) {
        self.identified_clients
            .lock()
            .expect("identified table poisoned")
            .entry((service, instance, reliable))
            .or_default()
            .insert(client);
    }

    pub fn has_identified(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        reliable: bool,
    ) -> bool {
        self.identified_clients
            .lock()
            .expect("identified table poisoned")
            .get(&(service, instance, reliable))
            .is_some_and(|clients| clients.contains(&client))
    }

    // ------------------------------------------------------------------
    // Error checking
    // ------------------------------------------------------------------

    /// Validate an incoming request against the protocol version, the
    /// provider table, and the provider's interface version.
    pub fn check_error(&self, data: &[u8], instance: InstanceId) -> ReturnCode {
        if data.len() < Header::SIZE || wire::get_message_size(data) != data.len() {
            return ReturnCode::MalformedMessage;
        }
        if data[wire::PROTOCOL_VERSION_POS] != wire::PROTOCOL_VERSION {
            return ReturnCode::WrongProtocolVersion;
        }
        let service = wire::peek_service(data).expect("length checked above");
        let services = self.services.lock().expect("service tables poisoned");
        let Some(info) = services.local.get(&(service, instance)) else {
            return ReturnCode::UnknownService;
        };
        let interface_version = data[wire::INTERFACE_VERSION_POS];
        if interface_version != ANY_MAJOR && interface_version != info.major {
            return ReturnCode::WrongInterfaceVersion;
        }
        ReturnCode::Ok
    }

    /// Send an ERROR response for a rejected request back through the
    /// endpoint that received it.
    pub fn send_error(
        &self,
        return_code: ReturnCode,
        data: &[u8],
        _instance: InstanceId,
        _reliable: bool,
        receiver: EndpointId,
    ) {
        if data.len() < Header::SIZE {
            return;
        }
        let mut error_frame = [0u8; Header::SIZE];
        error_frame.copy_from_slice(&data[..Header::SIZE]);
        // Echo service/method/client/session, reset the length to a bare
        // header, flag the type and code.
        error_frame[wire::LENGTH_POS..wire::LENGTH_POS + 4]
            .copy_from_slice(&(Header::SIZE as u32 - wire::LENGTH_PREFIX_SIZE as u32).to_be_bytes());
        error_frame[wire::PROTOCOL_VERSION_POS] = wire::PROTOCOL_VERSION;
        error_frame[wire::MESSAGE_TYPE_POS] = MessageType::Error as u8;
        error_frame[wire::RETURN_CODE_POS] = return_code as u8;

        if let Some(endpoint) = self.server_endpoint_by_id(receiver) {
            endpoint.send(&error_frame, true);
        }
    }

    // ------------------------------------------------------------------
    // Endpoint management
    // ------------------------------------------------------------------

    fn map_service_instance(&self, service: ServiceId, endpoint: EndpointId, instance: InstanceId) {
        self.endpoints
            .lock()
            .expect("endpoint tables poisoned")
            .service_instances
            .entry(service)
            .or_default()
            .insert(endpoint, instance);
    }

    /// Resolve which instance of `service` the message reached through
    /// `receiver`.
    fn find_instance(&self, service: ServiceId, receiver: EndpointId) -> Option<InstanceId> {
        self.endpoints
            .lock()
            .expect("endpoint tables poisoned")
            .service_instances
            .get(&service)
            .and_then(|by_endpoint| by_endpoint.get(&receiver))
            .copied()
    }

    async fn find_or_create_server_endpoint(
        self: &Arc<Self>,
        port: u16,
        reliable: bool,
    ) -> Result<ServerEndpointHandle<U, L>> {
        if let Some(existing) = self
            .endpoints
            .lock()
            .expect("endpoint tables poisoned")
            .server
            .get(&(port, reliable))
        {
            return Ok(existing.clone());
        }

        let bind_addr = SocketAddr::new(self.config.unicast, port);
        let host = self.endpoint_host();
        let created = if reliable {
            let endpoint =
                TcpServerEndpoint::<L>::bind(bind_addr, host, self.config.max_message_size).await?;
            ServerEndpointHandle::Tcp(endpoint)
        } else {
            let endpoint =
                UdpServerEndpoint::<U>::bind(bind_addr, host, self.config.max_message_size).await?;
            ServerEndpointHandle::Udp(endpoint)
        };

        // Re-check: a concurrent offer may have won the race while the
        // bind was in flight.
        let endpoint = {
            let mut endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
            match endpoints.server.get(&(port, reliable)).cloned() {
                Some(existing) => {
                    created.stop();
                    existing
                }
                None => {
                    endpoints.server.insert((port, reliable), created.clone());
                    created
                }
            }
        };
        match &endpoint {
            ServerEndpointHandle::Udp(udp) => udp.start(),
            ServerEndpointHandle::Tcp(tcp) => tcp.start(),
        }
        Ok(endpoint)
    }

    fn server_endpoint_for(
        &self,
        service: ServiceId,
        instance: InstanceId,
        reliable: bool,
    ) -> Option<ServerEndpointHandle<U, L>> {
        let port = self.config.find_service(service, instance).and_then(|layout| {
            if reliable {
                layout.reliable_port
            } else {
                layout.unreliable_port
            }
        })?;
        self.endpoints
            .lock()
            .expect("endpoint tables poisoned")
            .server
            .get(&(port, reliable))
            .cloned()
    }

    fn server_endpoint_by_id(&self, id: EndpointId) -> Option<ServerEndpointHandle<U, L>> {
        self.endpoints
            .lock()
            .expect("endpoint tables poisoned")
            .server
            .values()
            .find(|endpoint| endpoint.id() == id)
            .cloned()
    }

    async fn find_or_create_client_endpoint(
        self: &Arc<Self>,
        definition: EndpointDefinition,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
    ) -> Result<ClientEndpointHandle<U, L>> {
        let key = (
            definition.address,
            definition.port,
            definition.reliable,
            client,
        );
        if let Some(existing) = self
            .endpoints
            .lock()
            .expect("endpoint tables poisoned")
            .client
            .get(&key)
        {
            return Ok(existing.clone());
        }

        let host = self.endpoint_host();
        let created = if definition.reliable {
            let endpoint = TcpClientEndpoint::<L::Stream>::new(
                definition.socket_addr(),
                host,
                self.config.max_message_size,
            );
            ClientEndpointHandle::Tcp(endpoint)
        } else {
            let local = SocketAddr::new(IpAddr::from(Ipv4Addr::UNSPECIFIED), 0);
            let endpoint = UdpClientEndpoint::<U>::bind(
                local,
                definition.socket_addr(),
                host,
                self.config.max_message_size,
            )
            .await?;
            ClientEndpointHandle::Udp(endpoint)
        };

        let endpoint = {
            let mut endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
            match endpoints.client.get(&key).cloned() {
                Some(existing) => {
                    created.stop();
                    existing
                }
                None => {
                    if let ClientEndpointHandle::Udp(udp) = &created {
                        endpoints
                            .used_client_ports
                            .entry(false)
                            .or_default()
                            .insert(udp.local_addr().port());
                    }
                    endpoints.client.insert(key, created.clone());
                    created
                }
            }
        };
        self.map_service_instance(service, endpoint.id(), instance);
        match &endpoint {
            ClientEndpointHandle::Udp(udp) => udp.start(),
            ClientEndpointHandle::Tcp(tcp) => tcp.start(),
        }
        Ok(endpoint)
    }

    /// Stop and forget server endpoints whose (port, reliable) no longer
    /// backs any locally offered service.
    fn teardown_unused_server_endpoints(&self) {
        let needed: HashSet<(u16, bool)> = {
            let services = self.services.lock().expect("service tables poisoned");
            services
                .local
                .keys()
                .filter_map(|(service, instance)| self.config.find_service(*service, *instance))
                .flat_map(|layout| {
                    layout
                        .unreliable_port
                        .map(|port| (port, false))
                        .into_iter()
                        .chain(layout.reliable_port.map(|port| (port, true)))
                })
                .collect()
        };

        let stopped: Vec<ServerEndpointHandle<U, L>> = {
            let mut endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
            let doomed: Vec<(u16, bool)> = endpoints
                .server
                .keys()
                .filter(|key| !needed.contains(*key))
                .copied()
                .collect();
            let mut stopped = Vec::new();
            for key in doomed {
                if let Some(endpoint) = endpoints.server.remove(&key) {
                    let id = endpoint.id();
                    for by_endpoint in endpoints.service_instances.values_mut() {
                        by_endpoint.remove(&id);
                    }
                    stopped.push(endpoint);
                }
            }
            stopped
        };
        for endpoint in stopped {
            endpoint.stop();
        }
    }

    fn clear_client_endpoints_of(&self, client: ClientId) {
        let stopped: Vec<ClientEndpointHandle<U, L>> = {
            let mut endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
            let doomed: Vec<_> = endpoints
                .client
                .keys()
                .filter(|(_, _, _, owner)| *owner == client)
                .copied()
                .collect();
            let mut stopped = Vec::new();
            for key in doomed {
                if let Some(endpoint) = endpoints.client.remove(&key) {
                    if let ClientEndpointHandle::Udp(udp) = &endpoint {
                        if let Some(ports) = endpoints.used_client_ports.get_mut(&false) {
                            ports.remove(&udp.local_addr().port());
                        }
                    }
                    let id = endpoint.id();
                    for by_endpoint in endpoints.service_instances.values_mut() {
                        by_endpoint.remove(&id);
                    }
                    stopped.push(endpoint);
                }
            }
            stopped
        };
        for endpoint in stopped {
            endpoint.stop();
        }
    }

    fn clear_client_endpoints_to(&self, address: IpAddr) {
        let stopped: Vec<ClientEndpointHandle<U, L>> = {
            let mut endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
            let doomed: Vec<_> = endpoints
                .client
                .keys()
                .filter(|(addr, _, _, _)| *addr == address)
                .copied()
                .collect();
            let mut stopped = Vec::new();
            for key in doomed {
                if let Some(endpoint) = endpoints.client.remove(&key) {
                    let id = endpoint.id();
                    for by_endpoint in endpoints.service_instances.values_mut() {
                        by_endpoint.remove(&id);
                    }
                    stopped.push(endpoint);
                }
            }
            stopped
        };
        for endpoint in stopped {
            endpoint.stop();
        }
    }

    // ------------------------------------------------------------------
    // Inbound delivery
    // ------------------------------------------------------------------

    fn reliable_of(&self, receiver: EndpointId) -> bool {
        let endpoints = self.endpoints.lock().expect("endpoint tables poisoned");
        endpoints
            .server
            .iter()
            .find(|(_, endpoint)| endpoint.id() == receiver)
            .map(|((_, reliable), _)| *reliable)
            .or_else(|| {
                endpoints
                    .client
                    .iter()
                    .find(|(_, endpoint)| endpoint.id() == receiver)
                    .map(|((_, _, reliable, _), _)| *reliable)
            })
            .unwrap_or(false)
    }

    /// Deliver an inbound notification: refresh the cached value of a
    /// consumed field, then hand the message to the application.
    fn deliver_notification(&self, data: &[u8], instance: InstanceId, reliable: bool) {
        let Some(message) = Message::from_wire(data, instance, reliable) else {
            tracing::warn!("dropping unparseable notification");
            return;
        };
        let is_consumed_field = self
            .registry
            .with_event(message.service, instance, message.method, |info| {
                info.is_field && !info.is_provided
            })
            .unwrap_or(false);
        if is_consumed_field {
            self.registry
                .set_payload(message.service, instance, message.method, message.payload.clone());
        }
        if let Some(host) = self.host() {
            host.on_message(message);
        }
    }
}

// ============================================================================
// ENDPOINT HOST
// ============================================================================

impl<U: UdpSocket, L: TcpListener> EndpointHost for RoutingManager<U, L> {
    fn on_message(&self, data: &[u8], receiver: EndpointId, destination: Destination) {
        if data.len() < Header::SIZE {
            tracing::warn!("dropping runt message ({} bytes)", data.len());
            return;
        }
        let service = wire::peek_service(data).expect("length checked above");
        let message_type = data[wire::MESSAGE_TYPE_POS];

        if service == wire::SD_SERVICE_ID {
            self.discovery().on_message(data, destination.is_multicast());
            return;
        }

        if destination.is_multicast() {
            // Only notifications travel on eventgroup multicast.
            if MessageType::from_u8(message_type) == Some(MessageType::Notification) {
                let instance = self.find_instance(service, receiver).unwrap_or(crate::ANY_INSTANCE);
                self.deliver_notification(data, instance, false);
            }
            return;
        }

        match MessageType::from_u8(message_type) {
            Some(MessageType::Request) | Some(MessageType::RequestNoReturn) => {
                let instance = self.find_instance(service, receiver).unwrap_or(crate::ANY_INSTANCE);
                let reliable = self.reliable_of(receiver);
                match self.check_error(data, instance) {
                    ReturnCode::Ok => {
                        if let Some(message) = Message::from_wire(data, instance, reliable) {
                            if let Some(host) = self.host() {
                                host.on_message(message);
                            }
                        }
                    }
                    code => {
                        tracing::warn!(
                            "rejecting request for {:04x}.{:04x}: {:?}",
                            service,
                            instance,
                            code
                        );
                        // Fire-and-forget requests get no error response.
                        if MessageType::from_u8(message_type) == Some(MessageType::Request) {
                            self.send_error(code, data, instance, reliable, receiver);
                        }
                    }
                }
            }
            Some(MessageType::Response) | Some(MessageType::Error) => {
                let instance = self.find_instance(service, receiver).unwrap_or(crate::ANY_INSTANCE);
                let reliable = self.reliable_of(receiver);
                if let Some(message) = Message::from_wire(data, instance, reliable) {
                    if let Some(host) = self.host() {
                        host.on_message(message);
                    }
                }
            }
            Some(MessageType::Notification) => {
                let instance = self.find_instance(service, receiver).unwrap_or(crate::ANY_INSTANCE);
                let reliable = self.reliable_of(receiver);
                self.deliver_notification(data, instance, reliable);
            }
            other => {
                tracing::warn!("dropping message with unhandled type {:?}", other);
            }
        }
    }

    fn on_error(&self, data: &[u8], receiver: EndpointId) {
        tracing::error!(
            "malformed data ({} bytes) on endpoint {:?}",
            data.len(),
            receiver
        );
    }

    fn on_connect(&self, receiver: EndpointId, reliable: bool) {
        tracing::debug!("endpoint {:?} connected (reliable={})", receiver, reliable);
    }

    fn on_disconnect(&self, receiver: EndpointId, reliable: bool) {
        tracing::debug!("endpoint {:?} disconnected (reliable={})", receiver, reliable);
    }
}

// ============================================================================
// DISCOVERY HOST
// ============================================================================

impl<U: UdpSocket, L: TcpListener> DiscoveryHost for RoutingManager<U, L> {
    fn add_routing_info(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
    ) {
        // A local provider is never supplanted by a remote offer.
        let requested;
        {
            let mut services = self.services.lock().expect("service tables poisoned");
            if services.local.contains_key(&(service, instance)) {
                tracing::debug!(
                    "ignoring remote offer for locally provided {:04x}.{:04x}",
                    service,
                    instance
                );
                return;
            }
            services.remote.insert(
                (service, instance),
                ServiceInfo::remote(
                    major,
                    minor,
                    ttl,
                    reliable.map(|addr| EndpointDefinition::new(addr.ip(), addr.port(), true)),
                    unreliable.map(|addr| EndpointDefinition::new(addr.ip(), addr.port(), false)),
                ),
            );
            requested = self.is_requested(service, instance);
        }
        if requested {
            if let Some(host) = self.host.upgrade() {
                host.on_availability(service, instance, true, major, minor);
            }
        }
    }

    fn del_routing_info(
        &self,
        service: ServiceId,
        instance: InstanceId,
        _has_reliable: bool,
        _has_unreliable: bool,
    ) {
        let removed = {
            let mut services = self.services.lock().expect("service tables poisoned");
            services.remote.remove(&(service, instance))
        };
        let Some(info) = removed else {
            return;
        };

        for definition in [info.reliable_endpoint, info.unreliable_endpoint]
            .into_iter()
            .flatten()
        {
            self.clear_client_endpoints_to(definition.address);
            self.registry.expire_subscriptions_of(definition.address);
        }
        self.subscription_state
            .lock()
            .expect("subscription table poisoned")
            .retain(|(s, i, _, _), _| !(*s == service && *i == instance));

        if let Some(host) = self.host.upgrade() {
            host.on_availability(service, instance, false, info.major, info.minor);
        }
    }

    fn update_routing_info(&self, elapsed: Duration) -> Option<Duration> {
        let elapsed_seconds = elapsed.as_secs().min(u64::from(u32::MAX)) as Ttl;
        let (expired, smallest) = {
            let mut services = self.services.lock().expect("service tables poisoned");
            let mut expired = Vec::new();
            let mut smallest: Option<Ttl> = None;
            services.remote.retain(|key, info| {
                if info.age(elapsed_seconds) {
                    if info.ttl != TTL_INFINITE {
                        smallest = Some(smallest.map_or(info.ttl, |s| s.min(info.ttl)));
                    }
                    true
                } else {
                    expired.push((*key, info.clone()));
                    false
                }
            });
            (expired, smallest)
        };

        for ((service, instance), info) in expired {
            tracing::info!(
                "remote service {:04x}.{:04x} expired after TTL",
                service,
                instance
            );
            for definition in [info.reliable_endpoint, info.unreliable_endpoint]
                .into_iter()
                .flatten()
            {
                self.clear_client_endpoints_to(definition.address);
                self.registry.expire_subscriptions_of(definition.address);
            }
            if let Some(host) = self.host.upgrade() {
                host.on_availability(service, instance, false, info.major, info.minor);
            }
        }

        smallest.map(|seconds| Duration::from_secs(u64::from(seconds)))
    }

    fn on_remote_subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: EndpointDefinition,
        expiration: Instant,
    ) -> bool {
        let provided = {
            let services = self.services.lock().expect("service tables poisoned");
            services.local.contains_key(&(service, instance))
        };
        if !provided {
            return false;
        }

        let subscriber_client = self
            .server_endpoint_for(service, instance, subscriber.reliable)
            .map(|endpoint| endpoint.get_client(&subscriber))
            .unwrap_or(0);

        let newly = self
            .registry
            .with_eventgroup(service, instance, eventgroup, |group| {
                group.add_target(Target {
                    endpoint: subscriber,
                    expiration,
                })
            });
        let Some(newly) = newly else {
            tracing::warn!(
                "remote subscribe to unknown eventgroup {:04x}.{:04x}/{:04x}",
                service,
                instance,
                eventgroup
            );
            return false;
        };

        let accepted = self
            .host
            .upgrade()
            .map(|host| host.on_subscription(service, instance, eventgroup, subscriber_client, true))
            .unwrap_or(false);
        if !accepted {
            self.registry
                .with_eventgroup(service, instance, eventgroup, |group| {
                    group.remove_target(&subscriber);
                });
            return false;
        }

        self.remote_subscribers
            .lock()
            .expect("remote subscriber table poisoned")
            .entry((service, instance, subscriber_client))
            .or_default()
            .insert(subscriber);

        if newly {
            // Replay cached field values to the fresh subscriber.
            for (event, payload) in self.registry.cached_fields(service, instance, eventgroup) {
                let wire_bytes = Message::notification(service, instance, event)
                    .with_payload(payload)
                    .to_wire();
                if let Some(endpoint) =
                    self.server_endpoint_for(service, instance, subscriber.reliable)
                {
                    endpoint.send_to(&subscriber, &wire_bytes, true);
                }
            }
        }
        true
    }

    fn on_remote_unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: &EndpointDefinition,
    ) {
        self.registry
            .with_eventgroup(service, instance, eventgroup, |group| {
                group.remove_target(subscriber);
            });
        let mut subscribers = self
            .remote_subscribers
            .lock()
            .expect("remote subscriber table poisoned");
        for targets in subscribers.values_mut() {
            targets.remove(subscriber);
        }
        subscribers.retain(|_, targets| !targets.is_empty());
    }

    fn on_subscribe_ack(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.set_subscription_state(
            service,
            instance,
            eventgroup,
            client,
            SubscriptionState::Acknowledged,
        );
    }

    fn on_subscribe_nack(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.set_subscription_state(
            service,
            instance,
            eventgroup,
            client,
            SubscriptionState::Nacked,
        );
        if let Some(host) = self.host.upgrade() {
            host.on_subscription_error(service, instance, eventgroup, SUBSCRIPTION_REJECTED);
        }
    }

    fn expire_subscriptions(&self) -> Option<Instant> {
        self.registry.expire_subscriptions(Instant::now())
    }

    fn expire_subscriptions_of(&self, address: IpAddr) {
        self.registry.expire_subscriptions_of(address);
    }

    fn expire_services_of(&self, address: IpAddr) {
        let expired = {
            let mut services = self.services.lock().expect("service tables poisoned");
            let mut expired = Vec::new();
            services.remote.retain(|key, info| {
                let matches = [info.reliable_endpoint, info.unreliable_endpoint]
                    .into_iter()
                    .flatten()
                    .any(|definition| definition.address == address);
                if matches {
                    expired.push((*key, info.clone()));
                }
                !matches
            });
            expired
        };
        for ((service, instance), info) in expired {
            self.clear_client_endpoints_to(address);
            self.registry.expire_subscriptions_of(address);
            if let Some(host) = self.host.upgrade() {
                host.on_availability(service, instance, false, info.major, info.minor);
            }
        }
    }
}

impl<U: UdpSocket, L: TcpListener> RoutingManager<U, L> {
    /// Whether any client has requested (service, instance), honoring the
    /// wildcard instance.
    fn is_requested(&self, service: ServiceId, instance: InstanceId) -> bool {
        let requested = self.requested.lock().expect("request table poisoned");
        requested.values().any(|by_service| {
            by_service.get(&service).is_some_and(|by_instance| {
                by_instance.contains_key(&instance)
                    || by_instance.contains_key(&crate::ANY_INSTANCE)
            })
        })
    }
}
