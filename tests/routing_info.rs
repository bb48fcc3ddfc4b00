//! Routing manager table maintenance driven through the discovery host
//! interface.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use routeip::routing::{RegistrationState, RoutingHost, RoutingManager};
use routeip::sd::DiscoveryHost;
use routeip::{Config, Message, ReturnCode};

const SERVICE: u16 = 0x4711;
const INSTANCE: u16 = 0x0001;

/// Routing host that records availability transitions.
#[derive(Default)]
struct ObservingHost {
    availability: Mutex<Vec<(u16, u16, bool)>>,
    messages: Mutex<Vec<Message>>,
}

impl RoutingHost for ObservingHost {
    fn on_message(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }

    fn on_availability(&self, service: u16, instance: u16, available: bool, _major: u8, _minor: u32) {
        self.availability.lock().unwrap().push((service, instance, available));
    }

    fn on_state(&self, _state: RegistrationState) {}

    fn on_subscription(&self, _: u16, _: u16, _: u16, _: u16, _subscribed: bool) -> bool {
        true
    }

    fn on_subscription_error(&self, _: u16, _: u16, _: u16, _error: u16) {}
}

type Manager = RoutingManager<tokio::net::UdpSocket, tokio::net::TcpListener>;

fn manager_with_host() -> (Arc<Manager>, Arc<ObservingHost>) {
    let host = Arc::new(ObservingHost::default());
    let strong: Arc<dyn RoutingHost> = Arc::clone(&host) as Arc<dyn RoutingHost>;
    let manager = RoutingManager::new(
        Config::builder().application_name("routing-info-test").build(),
        0x0042,
        Arc::downgrade(&strong),
    );
    (manager, host)
}

fn provider_addr() -> SocketAddr {
    "192.0.2.10:30509".parse().unwrap()
}

#[test_log::test(tokio::test)]
async fn requested_remote_offer_reports_availability() {
    let (manager, host) = manager_with_host();

    manager.request_service(0x0042, SERVICE, INSTANCE, 1, 0, false);
    manager.add_routing_info(SERVICE, INSTANCE, 1, 0, 30, None, Some(provider_addr()));

    assert!(host
        .availability
        .lock()
        .unwrap()
        .contains(&(SERVICE, INSTANCE, true)));
}

#[test_log::test(tokio::test)]
async fn unrequested_remote_offer_stays_silent() {
    let (manager, host) = manager_with_host();

    manager.add_routing_info(SERVICE, INSTANCE, 1, 0, 30, None, Some(provider_addr()));
    assert!(host.availability.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn ttl_aging_expires_remote_services() {
    let (manager, host) = manager_with_host();

    manager.request_service(0x0042, SERVICE, INSTANCE, 1, 0, false);
    manager.add_routing_info(SERVICE, INSTANCE, 1, 0, 10, None, Some(provider_addr()));

    // Partial aging keeps the entry and reports the remaining TTL.
    let remaining = manager.update_routing_info(Duration::from_secs(4));
    assert_eq!(remaining, Some(Duration::from_secs(6)));

    // Exhausting the TTL withdraws the service.
    let remaining = manager.update_routing_info(Duration::from_secs(6));
    assert_eq!(remaining, None);
    assert!(host
        .availability
        .lock()
        .unwrap()
        .contains(&(SERVICE, INSTANCE, false)));
}

#[test_log::test(tokio::test)]
async fn infinite_ttl_survives_any_aging() {
    let (manager, host) = manager_with_host();

    manager.request_service(0x0042, SERVICE, INSTANCE, 1, 0, false);
    manager.add_routing_info(
        SERVICE,
        INSTANCE,
        1,
        0,
        routeip::TTL_INFINITE,
        None,
        Some(provider_addr()),
    );

    assert_eq!(manager.update_routing_info(Duration::from_secs(86_400)), None);
    assert!(!host
        .availability
        .lock()
        .unwrap()
        .contains(&(SERVICE, INSTANCE, false)));
}

#[test_log::test(tokio::test)]
async fn peer_loss_expires_its_services() {
    let (manager, host) = manager_with_host();

    manager.request_service(0x0042, SERVICE, INSTANCE, 1, 0, false);
    manager.add_routing_info(SERVICE, INSTANCE, 1, 0, 3600, None, Some(provider_addr()));

    manager.expire_services_of(provider_addr().ip());
    assert!(host
        .availability
        .lock()
        .unwrap()
        .contains(&(SERVICE, INSTANCE, false)));
}

#[test_log::test(tokio::test)]
async fn check_error_validates_requests() {
    let (manager, _host) = manager_with_host();
    manager
        .offer_service(0x0042, SERVICE, INSTANCE, 2, 0)
        .await
        .unwrap();

    let mut request = Message::request(SERVICE, INSTANCE, 0x0001);
    request.client = 0x0042;
    request.session = 1;
    request.interface_version = 2;
    let wire = request.to_wire();
    assert_eq!(manager.check_error(&wire, INSTANCE), ReturnCode::Ok);

    // Wrong protocol version.
    let mut bad = wire.to_vec();
    bad[12] = 0x02;
    assert_eq!(manager.check_error(&bad, INSTANCE), ReturnCode::WrongProtocolVersion);

    // Wrong interface version.
    let mut bad = wire.to_vec();
    bad[13] = 0x05;
    assert_eq!(
        manager.check_error(&bad, INSTANCE),
        ReturnCode::WrongInterfaceVersion
    );

    // Unknown provider.
    assert_eq!(
        manager.check_error(&wire, INSTANCE + 1),
        ReturnCode::UnknownService
    );

    // Truncated message.
    assert_eq!(
        manager.check_error(&wire[..12], INSTANCE),
        ReturnCode::MalformedMessage
    );
}

#[test_log::test(tokio::test)]
async fn local_provider_is_not_supplanted_by_remote_offer() {
    let (manager, host) = manager_with_host();
    manager
        .offer_service(0x0042, SERVICE, INSTANCE, 1, 0)
        .await
        .unwrap();

    manager.add_routing_info(SERVICE, INSTANCE, 1, 0, 30, None, Some(provider_addr()));

    // The remote offer is ignored; no second availability transition.
    let transitions = host.availability.lock().unwrap();
    assert_eq!(
        transitions
            .iter()
            .filter(|(s, i, up)| *s == SERVICE && *i == INSTANCE && *up)
            .count(),
        1
    );
}
