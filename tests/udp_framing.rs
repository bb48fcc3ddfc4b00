//! UDP server endpoint framing behavior over loopback sockets.

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use common::{build_message, wait_for, RecordingHost};
use routeip::endpoint::{EndpointDefinition, EndpointHost, UdpServerEndpoint};

const MAX_MESSAGE_SIZE: usize = 1400;

async fn bound_endpoint(
    host: &Arc<RecordingHost>,
) -> Arc<UdpServerEndpoint<tokio::net::UdpSocket>> {
    let strong: Arc<dyn EndpointHost> = Arc::clone(host) as Arc<dyn EndpointHost>;
    let endpoint = UdpServerEndpoint::<tokio::net::UdpSocket>::bind(
        SocketAddr::new(IpAddr::from(Ipv4Addr::LOCALHOST), 0),
        Arc::downgrade(&strong),
        MAX_MESSAGE_SIZE,
    )
    .await
    .expect("binding endpoint");
    endpoint.start();
    endpoint
}

#[test_log::test(tokio::test)]
async fn coalesced_datagram_yields_two_deliveries_in_order() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;

    // One datagram carrying a 24-byte and a 32-byte message.
    let mut datagram = build_message(0x1234, 0x0001, 0x0001, 0x0001, 0x00, 8);
    datagram.extend(build_message(0x5678, 0x0002, 0x0001, 0x0002, 0x00, 16));
    assert_eq!(datagram.len(), 24 + 32);

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&datagram, endpoint.local_addr()).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 2).await);
    let messages = host.messages.lock().unwrap();
    assert_eq!(messages[0].0.len(), 24);
    assert_eq!(messages[0].0[..2], [0x12, 0x34]);
    assert_eq!(messages[1].0.len(), 32);
    assert_eq!(messages[1].0[..2], [0x56, 0x78]);
    assert!(!messages[0].1.is_multicast());
    drop(messages);
    assert_eq!(host.error_count(), 0);

    // The receive was re-armed: a further datagram still arrives.
    sender
        .send_to(
            &build_message(0x1234, 0x0001, 0x0001, 0x0003, 0x00, 0),
            endpoint.local_addr(),
        )
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 3).await);
}

#[test_log::test(tokio::test)]
async fn bad_length_field_reports_whole_remainder_once() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;

    // 40 bytes declaring a length of 1000.
    let mut datagram = build_message(0x1234, 0x0001, 0x0001, 0x0001, 0x00, 24);
    datagram[4..8].copy_from_slice(&1000u32.to_be_bytes());
    assert_eq!(datagram.len(), 40);

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&datagram, endpoint.local_addr()).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || host.error_count() == 1).await);
    assert_eq!(host.errors.lock().unwrap()[0].len(), 40);
    assert_eq!(host.message_count(), 0);
}

#[test_log::test(tokio::test)]
async fn sd_message_with_trailing_bytes_is_discarded() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;

    // An SD message (service 0xFFFF) followed by a shorter trailer: the
    // SD part must fill the datagram, so everything is dropped without an
    // error callback.
    let mut datagram = build_message(0xFFFF, 0x8100, 0x0000, 0x0001, 0x02, 16);
    datagram.extend(build_message(0x1234, 0x0001, 0x0001, 0x0001, 0x00, 0));

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&datagram, endpoint.local_addr()).await.unwrap();

    // Follow with a valid message to prove the endpoint is still alive.
    sender
        .send_to(
            &build_message(0x4242, 0x0001, 0x0001, 0x0002, 0x00, 0),
            endpoint.local_addr(),
        )
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 1).await);
    assert_eq!(host.messages.lock().unwrap()[0].0[..2], [0x42, 0x42]);
    assert_eq!(host.error_count(), 0);
}

#[test_log::test(tokio::test)]
async fn sd_message_filling_the_datagram_is_delivered() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;

    let datagram = build_message(0xFFFF, 0x8100, 0x0000, 0x0001, 0x02, 20);
    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&datagram, endpoint.local_addr()).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 1).await);
    assert_eq!(host.messages.lock().unwrap()[0].0[..2], [0xFF, 0xFF]);
}

#[test_log::test(tokio::test)]
async fn reply_routing_reaches_the_original_requester() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;

    let requester = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let requester_addr = requester.local_addr().unwrap();

    let request = build_message(0x1234, 0x0001, 0x1234, 0x0001, 0x00, 0);
    requester.send_to(&request, endpoint.local_addr()).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 1).await);

    // The recorded client id is the wire value, no byte swap.
    let definition =
        EndpointDefinition::new(requester_addr.ip(), requester_addr.port(), false);
    assert_eq!(endpoint.get_client(&definition), 0x1234);
    assert_eq!(endpoint.reply_target(0x1234, 0x0001), Some(requester_addr));

    // A response addressed by (client, session) reaches exactly the
    // requester's socket.
    let response = build_message(0x1234, 0x0001, 0x1234, 0x0001, 0x80, 4);
    assert!(endpoint.send(&response, true));

    let mut buf = [0u8; 64];
    let received = tokio::time::timeout(Duration::from_secs(2), requester.recv_from(&mut buf))
        .await
        .expect("response within timeout")
        .unwrap();
    assert_eq!(received.0, response.len());
    assert_eq!(buf[14], 0x80);
}

#[test_log::test(tokio::test)]
async fn reply_table_overwrites_on_session_reuse() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;

    let first = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let request = build_message(0x1234, 0x0001, 0x0077, 0x0009, 0x00, 0);
    first.send_to(&request, endpoint.local_addr()).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 1).await);
    second.send_to(&request, endpoint.local_addr()).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || host.message_count() == 2).await);

    // Last writer wins.
    assert_eq!(
        endpoint.reply_target(0x0077, 0x0009),
        Some(second.local_addr().unwrap())
    );
}

#[test_log::test(tokio::test)]
async fn multicast_join_is_idempotent_and_reversible() {
    let host = RecordingHost::new();
    let endpoint = bound_endpoint(&host).await;
    let group = Ipv4Addr::new(239, 255, 0, 42);

    assert!(!endpoint.is_joined(group));
    endpoint.join(group).await;
    assert!(endpoint.is_joined(group));
    endpoint.join(group).await;
    assert!(endpoint.is_joined(group));

    endpoint.leave(group);
    assert!(!endpoint.is_joined(group));
    endpoint.leave(group);
    assert!(!endpoint.is_joined(group));
}
