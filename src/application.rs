//! # Application Runtime
//!
//! Per-process façade over the routing manager: holds the user's handler
//! tables, drives the dispatcher pool, allocates session ids, and answers
//! availability queries.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──▶ init() ──▶ start() ──▶ run() ──▶ stop()
//!            │           │                     │
//!            │           └ dispatchers spawn   └ dispatchers joined,
//!            └ router created                    endpoints closed
//! ```
//!
//! The application registers against its own router (this crate covers
//! the routing-host role), so `start()` reaches `Registered` immediately
//! and deferred availability handlers materialize at that point.
//!
//! ## Handler dispatch
//!
//! Every user callback is enqueued on the dispatcher pool and runs on a
//! dispatcher thread, never on the I/O executor. Message handlers are
//! keyed by `(service, instance, method)`; the wildcard keys
//! `ANY_SERVICE`/`ANY_INSTANCE`/`ANY_METHOD` match only when no exact key
//! does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::config::Config;
use crate::dispatch::DispatcherPool;
use crate::net::{TcpListener, UdpSocket};
use crate::routing::{Message, RegistrationState, RoutingHost, RoutingManager};
use crate::wire::MessageType;
use crate::{
    ClientId, Error, EventId, EventgroupId, InstanceId, MajorVersion, MethodId, MinorVersion,
    Result, ServiceId, SessionId, ANY_EVENT, ANY_INSTANCE, ANY_METHOD, ANY_SERVICE,
};

// ============================================================================
// HANDLER TYPES
// ============================================================================

/// Handler for received messages.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;
/// Handler for availability changes.
pub type AvailabilityHandler = Arc<dyn Fn(ServiceId, InstanceId, bool) + Send + Sync>;
/// Handler for registration state changes.
pub type StateHandler = Arc<dyn Fn(RegistrationState) + Send + Sync>;
/// Handler deciding on (un)subscriptions to a provided eventgroup.
pub type SubscriptionHandler = Arc<dyn Fn(ClientId, bool) -> bool + Send + Sync>;
/// Handler for subscription failures.
pub type SubscriptionErrorHandler = Arc<dyn Fn(u16) + Send + Sync>;

struct AvailabilityEntry {
    major: MajorVersion,
    minor: MinorVersion,
    handler: AvailabilityHandler,
    registered: bool,
}

// ============================================================================
// APPLICATION
// ============================================================================

/// The application runtime. One per process.
pub struct Application<U: UdpSocket = tokio::net::UdpSocket, L: TcpListener = tokio::net::TcpListener>
{
    config: Config,
    client: ClientId,
    is_initialized: AtomicBool,
    state: Mutex<RegistrationState>,
    session: Mutex<SessionId>,
    routing: Mutex<Option<Arc<RoutingManager<U, L>>>>,
    pool: DispatcherPool,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    shutdown: tokio::sync::Notify,

    state_handler: Mutex<Option<StateHandler>>,
    members: Mutex<HashMap<(ServiceId, InstanceId, MethodId), MessageHandler>>,
    availability: Mutex<HashMap<ServiceId, HashMap<InstanceId, AvailabilityEntry>>>,
    subscription: Mutex<HashMap<(ServiceId, InstanceId, EventgroupId), SubscriptionHandler>>,
    subscription_error:
        Mutex<HashMap<(ServiceId, InstanceId, EventgroupId), SubscriptionErrorHandler>>,

    /// Services currently available: service → instance → major → minor.
    available: Mutex<HashMap<ServiceId, HashMap<InstanceId, HashMap<MajorVersion, MinorVersion>>>>,
    /// Events this application consumes, with a flag recording whether an
    /// initial value has been delivered (drives cached replay).
    event_subscriptions: Mutex<HashMap<(ServiceId, InstanceId, EventId), bool>>,
}

impl Application<tokio::net::UdpSocket, tokio::net::TcpListener> {
    /// Create an application from the configuration (environment
    /// overrides applied), backed by tokio sockets.
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_socket_type(config)
    }
}

impl<U: UdpSocket, L: TcpListener> Application<U, L> {
    /// Create an application with specific socket types. Mainly useful
    /// for testing with turmoil.
    pub fn with_socket_type(config: Config) -> Arc<Self> {
        let config = config.apply_env();
        let client = config.effective_client_id();
        // Configured limit plus the main dispatcher.
        let pool = DispatcherPool::new(config.max_dispatchers + 1, config.max_dispatch_time);
        Arc::new(Self {
            config,
            client,
            is_initialized: AtomicBool::new(false),
            state: Mutex::new(RegistrationState::Deregistered),
            session: Mutex::new(0x0001),
            routing: Mutex::new(None),
            pool,
            runtime: Mutex::new(None),
            shutdown: tokio::sync::Notify::new(),
            state_handler: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
            availability: Mutex::new(HashMap::new()),
            subscription: Mutex::new(HashMap::new()),
            subscription_error: Mutex::new(HashMap::new()),
            available: Mutex::new(HashMap::new()),
            event_subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Initialize: create the routing manager. Must run on the tokio
    /// runtime that will carry the socket I/O.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.is_initialized.swap(true, Ordering::SeqCst) {
            tracing::warn!("trying to initialize an already initialized application");
            return Ok(());
        }
        if !self.config.is_routing_host() {
            return Err(Error::BadConfiguration(
                "proxy mode is not supported; this application must be the routing host".into(),
            ));
        }

        *self.runtime.lock().expect("runtime slot poisoned") =
            Some(tokio::runtime::Handle::current());

        let host: Arc<dyn RoutingHost> = Arc::clone(self) as Arc<dyn RoutingHost>;
        let routing = RoutingManager::new(self.config.clone(), self.client, Arc::downgrade(&host));
        *self.routing.lock().expect("routing slot poisoned") = Some(routing);

        tracing::info!(
            "application \"{}\" initialized (client {:04x}, {} dispatchers, {:?} dispatch time)",
            self.config.application_name,
            self.client,
            self.config.max_dispatchers,
            self.config.max_dispatch_time
        );
        Ok(())
    }

    /// Start dispatching and register against the router.
    pub fn start(&self) {
        self.pool.start();
        if let Some(routing) = self.routing() {
            routing.start();
        }
        tracing::info!("application \"{}\" started", self.config.application_name);
    }

    /// Stop: no handler runs after this returns; endpoints are closed.
    pub fn stop(&self) {
        tracing::info!("stopping application \"{}\"", self.config.application_name);
        self.pool.stop();
        if let Some(routing) = self.routing() {
            routing.stop();
        }
        self.shutdown.notify_waiters();
    }

    /// Drive the application until `stop()` is called or SIGINT/SIGTERM
    /// arrives.
    pub async fn run(self: &Arc<Self>) {
        tokio::select! {
            () = self.shutdown.notified() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("waiting for shutdown signal failed: {}", e);
                }
                let app = Arc::clone(self);
                let _joined = tokio::task::spawn_blocking(move || app.stop()).await;
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.config.application_name
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.lock().expect("state poisoned")
    }

    /// Pool statistics (dispatcher counts).
    pub fn dispatcher_stats(&self) -> crate::dispatch::DispatcherStats {
        self.pool.stats()
    }

    fn routing(&self) -> Option<Arc<RoutingManager<U, L>>> {
        self.routing.lock().expect("routing slot poisoned").clone()
    }

    fn require_routing(&self) -> Result<Arc<RoutingManager<U, L>>> {
        self.routing().ok_or(Error::Stopped)
    }

    // ------------------------------------------------------------------
    // Session ids
    // ------------------------------------------------------------------

    /// Allocate the next session id: `1, 2, ..., 0xFFFF, 1, ...`; zero is
    /// skipped on wrap.
    pub fn next_session(&self) -> SessionId {
        let mut session = self.session.lock().expect("session counter poisoned");
        let current = *session;
        *session = session.wrapping_add(1);
        if *session == 0 {
            *session = 1;
        }
        current
    }

    // ------------------------------------------------------------------
    // Offering and requesting services
    // ------------------------------------------------------------------

    pub async fn offer_service(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        let routing = self.require_routing()?;
        routing
            .offer_service(self.client, service, instance, major, minor)
            .await
    }

    pub fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        if let Some(routing) = self.routing() {
            routing.stop_offer_service(self.client, service, instance, major, minor);
        }
    }

    /// Request a remote service. With `use_exclusive_proxy` the identify
    /// handshake handler is installed on `ANY_METHOD - 1` and its response
    /// routed back to the router.
    pub fn request_service(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        use_exclusive_proxy: bool,
    ) {
        if use_exclusive_proxy {
            let weak = Arc::downgrade(self);
            self.register_message_handler(service, instance, ANY_METHOD - 1, move |response| {
                if let Some(app) = weak.upgrade() {
                    if let Some(routing) = app.routing() {
                        routing.on_identify_response(
                            app.client,
                            response.service,
                            response.instance,
                            response.reliable,
                        );
                    }
                }
            });
        }
        if let Some(routing) = self.routing() {
            routing.request_service(self.client, service, instance, major, minor, use_exclusive_proxy);
        }
    }

    pub fn release_service(&self, service: ServiceId, instance: InstanceId) {
        if let Some(routing) = self.routing() {
            routing.release_service(self.client, service, instance);
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Offer an event (or field) as part of the given eventgroups.
    pub fn offer_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroups: &std::collections::HashSet<EventgroupId>,
        is_field: bool,
    ) {
        let Some(routing) = self.routing() else {
            return;
        };
        routing.registry().register_event(
            service,
            instance,
            event,
            eventgroups,
            is_field,
            true,
            crate::DEFAULT_MAJOR,
            crate::TTL_INFINITE,
        );
        if let Some((address, port)) = self
            .config
            .find_service(service, instance)
            .and_then(|layout| layout.multicast)
        {
            for eventgroup in eventgroups {
                routing
                    .registry()
                    .with_eventgroup(service, instance, *eventgroup, |group| {
                        group.multicast = Some((address, port));
                    });
            }
        }
    }

    pub fn stop_offer_event(&self, service: ServiceId, instance: InstanceId, event: EventId) {
        if let Some(routing) = self.routing() {
            routing.registry().unregister_event(service, instance, event);
        }
    }

    /// Declare interest in a consumed event (or field).
    pub fn request_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroups: &std::collections::HashSet<EventgroupId>,
        is_field: bool,
    ) {
        if let Some(routing) = self.routing() {
            routing.registry().register_event(
                service,
                instance,
                event,
                eventgroups,
                is_field,
                false,
                crate::DEFAULT_MAJOR,
                crate::TTL_INFINITE,
            );
        }
    }

    pub fn release_event(&self, service: ServiceId, instance: InstanceId, event: EventId) {
        if let Some(routing) = self.routing() {
            routing.registry().unregister_event(service, instance, event);
        }
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    /// Subscribe to an eventgroup. `event` narrows the cached-replay
    /// bookkeeping to one event; pass [`ANY_EVENT`] for the whole group.
    pub async fn subscribe(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
    ) -> Result<()> {
        let replay_cached = {
            let mut subscriptions = self
                .event_subscriptions
                .lock()
                .expect("event subscription table poisoned");
            match subscriptions.get(&(service, instance, event)).copied() {
                // Initial values were already delivered once; replay the
                // cache so this subscriber sees a coherent value stream.
                Some(delivered) => delivered,
                None => {
                    subscriptions.insert((service, instance, event), false);
                    false
                }
            }
        };
        if replay_cached {
            self.send_back_cached(service, instance, eventgroup, event);
        }

        let routing = self.require_routing()?;
        routing
            .subscribe(self.client, service, instance, eventgroup, major)
            .await
    }

    pub fn unsubscribe(&self, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId) {
        if let Some(routing) = self.routing() {
            routing.unsubscribe(self.client, service, instance, eventgroup);
        }
    }

    /// Synthesize initial NOTIFICATIONs from cached field values and queue
    /// them for dispatch.
    fn send_back_cached(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    ) {
        let Some(routing) = self.routing() else {
            return;
        };
        let cached = routing.registry().cached_fields(service, instance, eventgroup);
        for (cached_event, payload) in cached {
            if event != ANY_EVENT && cached_event != event {
                continue;
            }
            let mut message =
                Message::notification(service, instance, cached_event).with_payload(payload);
            message.initial = true;
            self.on_message(message);
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a message. Requests are stamped with this application's
    /// client id and the next session id before serialization.
    pub async fn send(self: &Arc<Self>, mut message: Message, flush: bool) -> Result<()> {
        let routing = self.require_routing()?;
        if matches!(
            message.message_type,
            MessageType::Request | MessageType::RequestNoReturn
        ) {
            message.client = self.client;
            message.session = self.next_session();
        }
        let wire_bytes = message.to_wire();
        routing
            .send(self.client, &wire_bytes, message.instance, flush, message.reliable)
            .await
    }

    /// Publish an event to all subscribers.
    pub fn notify(&self, service: ServiceId, instance: InstanceId, event: EventId, payload: Bytes) {
        if let Some(routing) = self.routing() {
            routing.notify(service, instance, event, payload);
        }
    }

    /// Publish an event to one subscriber.
    pub fn notify_one(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        client: ClientId,
    ) {
        if let Some(routing) = self.routing() {
            routing.notify_one(service, instance, event, payload, client, false);
        }
    }

    /// Whether a matching service instance is currently available.
    pub fn is_available(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> bool {
        let available = self.available.lock().expect("availability table poisoned");
        let Some(by_instance) = available.get(&service) else {
            return false;
        };
        let instances: Vec<&HashMap<MajorVersion, MinorVersion>> = if instance == ANY_INSTANCE {
            by_instance.values().collect()
        } else {
            by_instance.get(&instance).into_iter().collect()
        };
        instances.iter().any(|by_major| {
            if major == crate::ANY_MAJOR
                || (major == crate::DEFAULT_MAJOR && minor == crate::DEFAULT_MINOR)
            {
                !by_major.is_empty()
            } else {
                by_major
                    .get(&major)
                    .is_some_and(|available_minor| minor <= *available_minor)
            }
        })
    }

    // ------------------------------------------------------------------
    // Handler registration
    // ------------------------------------------------------------------

    pub fn register_state_handler(&self, handler: impl Fn(RegistrationState) + Send + Sync + 'static) {
        *self.state_handler.lock().expect("state handler poisoned") = Some(Arc::new(handler));
    }

    pub fn unregister_state_handler(&self) {
        *self.state_handler.lock().expect("state handler poisoned") = None;
    }

    pub fn register_message_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) {
        self.members
            .lock()
            .expect("member table poisoned")
            .insert((service, instance, method), Arc::new(handler));
    }

    pub fn unregister_message_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) {
        self.members
            .lock()
            .expect("member table poisoned")
            .remove(&(service, instance, method));
    }

    /// Register an availability handler. Before the application is
    /// registered the handler is deferred; it materializes on entering
    /// `Registered`. When registered it fires immediately with the
    /// current availability.
    pub fn register_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: impl Fn(ServiceId, InstanceId, bool) + Send + Sync + 'static,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let handler: AvailabilityHandler = Arc::new(handler);
        if self.state() == RegistrationState::Registered {
            self.do_register_availability_handler(service, instance, handler, major, minor);
        } else {
            self.availability
                .lock()
                .expect("availability table poisoned")
                .entry(service)
                .or_default()
                .insert(
                    instance,
                    AvailabilityEntry {
                        major,
                        minor,
                        handler,
                        registered: false,
                    },
                );
        }
    }

    fn do_register_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: AvailabilityHandler,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let available_now = self.is_available(service, instance, major, minor);
        self.availability
            .lock()
            .expect("availability table poisoned")
            .entry(service)
            .or_default()
            .insert(
                instance,
                AvailabilityEntry {
                    major,
                    minor,
                    handler: Arc::clone(&handler),
                    registered: true,
                },
            );
        self.pool.enqueue(Box::new(move || {
            handler(service, instance, available_now);
        }));
    }

    pub fn unregister_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let mut availability = self.availability.lock().expect("availability table poisoned");
        if let Some(by_instance) = availability.get_mut(&service) {
            if by_instance
                .get(&instance)
                .is_some_and(|entry| entry.major == major && entry.minor == minor)
            {
                by_instance.remove(&instance);
            }
            if by_instance.is_empty() {
                availability.remove(&service);
            }
        }
    }

    /// Register a subscription handler for a provided eventgroup. The
    /// identify auto-responder on `ANY_METHOD - 1` is installed alongside
    /// it.
    pub fn register_subscription_handler(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        handler: impl Fn(ClientId, bool) -> bool + Send + Sync + 'static,
    ) {
        self.subscription
            .lock()
            .expect("subscription table poisoned")
            .insert((service, instance, eventgroup), Arc::new(handler));

        let weak = Arc::downgrade(self);
        self.register_message_handler(service, instance, ANY_METHOD - 1, move |request| {
            let Some(app) = weak.upgrade() else {
                return;
            };
            let response = Message::response_to(request);
            let Some(handle) = app.runtime.lock().expect("runtime slot poisoned").clone() else {
                return;
            };
            let app = Arc::clone(&app);
            handle.spawn(async move {
                if let Err(e) = app.send(response, true).await {
                    tracing::warn!("identify response failed: {}", e);
                }
            });
        });
    }

    pub fn unregister_subscription_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.subscription
            .lock()
            .expect("subscription table poisoned")
            .remove(&(service, instance, eventgroup));
        self.unregister_message_handler(service, instance, ANY_METHOD - 1);
    }

    pub fn register_subscription_error_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        handler: impl Fn(u16) + Send + Sync + 'static,
    ) {
        self.subscription_error
            .lock()
            .expect("subscription error table poisoned")
            .insert((service, instance, eventgroup), Arc::new(handler));
    }

    pub fn unregister_subscription_error_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.subscription_error
            .lock()
            .expect("subscription error table poisoned")
            .remove(&(service, instance, eventgroup));
    }

    /// Drop every registered handler.
    pub fn clear_all_handlers(&self) {
        self.unregister_state_handler();
        self.availability
            .lock()
            .expect("availability table poisoned")
            .clear();
        self.subscription
            .lock()
            .expect("subscription table poisoned")
            .clear();
        self.subscription_error
            .lock()
            .expect("subscription error table poisoned")
            .clear();
        self.members.lock().expect("member table poisoned").clear();
    }

    /// Exact-first, wildcard-fallback handler lookup.
    fn find_message_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> Option<MessageHandler> {
        let members = self.members.lock().expect("member table poisoned");
        for service_key in [service, ANY_SERVICE] {
            for instance_key in [instance, ANY_INSTANCE] {
                for method_key in [method, ANY_METHOD] {
                    if let Some(handler) = members.get(&(service_key, instance_key, method_key)) {
                        return Some(Arc::clone(handler));
                    }
                }
            }
        }
        None
    }
}

// ============================================================================
// ROUTING HOST
// ============================================================================

impl<U: UdpSocket, L: TcpListener> RoutingHost for Application<U, L> {
    fn on_message(&self, message: Message) {
        if message.message_type == MessageType::Notification {
            let mut subscriptions = self
                .event_subscriptions
                .lock()
                .expect("event subscription table poisoned");
            let key = (message.service, message.instance, message.method);
            let previous = subscriptions.insert(key, true);
            if previous.is_none() {
                // An event nobody asked for by id: remember that its
                // initial value passed by, deliver only if someone
                // subscribed to the whole group.
                let any_key = (message.service, message.instance, ANY_EVENT);
                if !subscriptions.contains_key(&any_key) {
                    return;
                }
            }
        }

        let Some(handler) =
            self.find_message_handler(message.service, message.instance, message.method)
        else {
            tracing::debug!(
                "no handler for {:04x}.{:04x}/{:04x}",
                message.service,
                message.instance,
                message.method
            );
            return;
        };
        self.pool.enqueue(Box::new(move || {
            handler(&message);
        }));
    }

    fn on_availability(
        &self,
        service: ServiceId,
        instance: InstanceId,
        is_available: bool,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        {
            let mut available = self.available.lock().expect("availability table poisoned");
            if is_available {
                available
                    .entry(service)
                    .or_default()
                    .entry(instance)
                    .or_default()
                    .insert(major, minor);
            } else if let Some(by_instance) = available.get_mut(&service) {
                if let Some(by_major) = by_instance.get_mut(&instance) {
                    by_major.remove(&major);
                    if by_major.is_empty() {
                        by_instance.remove(&instance);
                    }
                }
                if by_instance.is_empty() {
                    available.remove(&service);
                }
            }
        }

        // A lost provider resets the replay bookkeeping: the next offer
        // delivers fresh initial values.
        if !is_available {
            let mut subscriptions = self
                .event_subscriptions
                .lock()
                .expect("event subscription table poisoned");
            for ((s, i, _), delivered) in subscriptions.iter_mut() {
                if *s == service && *i == instance {
                    *delivered = false;
                }
            }
        }

        let handlers: Vec<AvailabilityHandler> = {
            let availability = self.availability.lock().expect("availability table poisoned");
            let mut matched = Vec::new();
            if let Some(by_instance) = availability.get(&service) {
                for instance_key in [instance, ANY_INSTANCE] {
                    if let Some(entry) = by_instance.get(&instance_key) {
                        let version_matches = entry.major == major
                            || entry.major == crate::ANY_MAJOR
                            || (entry.major == crate::DEFAULT_MAJOR
                                && entry.minor == crate::DEFAULT_MINOR);
                        if version_matches {
                            matched.push(Arc::clone(&entry.handler));
                        }
                    }
                }
            }
            matched
        };
        for handler in handlers {
            self.pool.enqueue(Box::new(move || {
                handler(service, instance, is_available);
            }));
        }
    }

    fn on_state(&self, state: RegistrationState) {
        let changed = {
            let mut current = self.state.lock().expect("state poisoned");
            let changed = *current != state;
            *current = state;
            changed
        };

        if changed && state == RegistrationState::Registered {
            // Materialize deferred availability handlers.
            let deferred: Vec<(ServiceId, InstanceId, AvailabilityHandler, MajorVersion, MinorVersion)> = {
                let availability = self.availability.lock().expect("availability table poisoned");
                availability
                    .iter()
                    .flat_map(|(service, by_instance)| {
                        by_instance.iter().filter_map(|(instance, entry)| {
                            if entry.registered {
                                None
                            } else {
                                Some((
                                    *service,
                                    *instance,
                                    Arc::clone(&entry.handler),
                                    entry.major,
                                    entry.minor,
                                ))
                            }
                        })
                    })
                    .collect()
            };
            for (service, instance, handler, major, minor) in deferred {
                self.do_register_availability_handler(service, instance, handler, major, minor);
            }
        }

        let handler = self.state_handler.lock().expect("state handler poisoned").clone();
        if let Some(handler) = handler {
            self.pool.enqueue(Box::new(move || {
                handler(state);
            }));
        }
    }

    fn on_subscription(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
        subscribed: bool,
    ) -> bool {
        let handler = self
            .subscription
            .lock()
            .expect("subscription table poisoned")
            .get(&(service, instance, eventgroup))
            .cloned();
        match handler {
            Some(handler) => handler(client, subscribed),
            None => true,
        }
    }

    fn on_subscription_error(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        error: u16,
    ) {
        let handler = self
            .subscription_error
            .lock()
            .expect("subscription error table poisoned")
            .get(&(service, instance, eventgroup))
            .cloned();
        if let Some(handler) = handler {
            self.pool.enqueue(Box::new(move || {
                handler(error);
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_app() -> Arc<Application> {
        Application::new(Config::builder().application_name("test-app").build())
    }

    #[test]
    fn session_ids_skip_zero_on_wrap() {
        let app = test_app();
        assert_eq!(app.next_session(), 1);
        assert_eq!(app.next_session(), 2);

        // Fast-forward to the wrap.
        *app.session.lock().unwrap() = 0xFFFF;
        assert_eq!(app.next_session(), 0xFFFF);
        assert_eq!(app.next_session(), 1);
        assert_eq!(app.next_session(), 2);
    }

    #[test]
    fn wildcard_handler_matches_only_without_exact_key() {
        let app = test_app();
        app.register_message_handler(0x1234, 0x0001, ANY_METHOD, |_| {});
        app.register_message_handler(0x1234, 0x0001, 0x0042, |_| {});

        let exact = app.find_message_handler(0x1234, 0x0001, 0x0042).unwrap();
        let wildcard = app.find_message_handler(0x1234, 0x0001, 0x0099).unwrap();
        assert!(!Arc::ptr_eq(&exact, &wildcard));
        assert!(app.find_message_handler(0x9999, 0x0001, 0x0042).is_none());
    }

    #[test]
    fn availability_table_tracks_versions() {
        let app = test_app();
        app.on_availability(0x1234, 0x0001, true, 2, 7);

        assert!(app.is_available(0x1234, 0x0001, 2, 7));
        assert!(app.is_available(0x1234, 0x0001, 2, 3));
        assert!(!app.is_available(0x1234, 0x0001, 2, 8));
        assert!(!app.is_available(0x1234, 0x0001, 3, 0));
        assert!(app.is_available(0x1234, ANY_INSTANCE, crate::ANY_MAJOR, 0));

        app.on_availability(0x1234, 0x0001, false, 2, 7);
        assert!(!app.is_available(0x1234, 0x0001, 2, 7));
    }
}
