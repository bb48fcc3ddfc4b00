//! End-to-end request/response over a real UDP server endpoint: a raw
//! socket plays the remote consumer, the application answers, and the
//! response must come back to exactly the requester's socket.

mod common;

use std::sync::{mpsc, Mutex};
use std::time::Duration;

use common::build_message;
use routeip::{Application, Config, Message, ServiceConfig};

const SERVICE: u16 = 0x1234;
const INSTANCE: u16 = 0x0001;
const METHOD: u16 = 0x0421;

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn request_is_dispatched_and_response_reaches_the_requester() {
    let port = free_udp_port();
    let config = Config::builder()
        .application_name("udp-rpc-test")
        .service(ServiceConfig::new(SERVICE, INSTANCE).unreliable_port(port))
        .build();

    let app = Application::new(config);
    app.init().await.unwrap();
    app.start();
    app.offer_service(SERVICE, INSTANCE, 1, 0).await.unwrap();

    let (request_tx, request_rx) = mpsc::channel::<Message>();
    let request_tx = Mutex::new(request_tx);
    app.register_message_handler(SERVICE, INSTANCE, METHOD, move |message| {
        let _ = request_tx.lock().unwrap().send(message.clone());
    });

    // The remote consumer.
    let requester = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = build_message(SERVICE, METHOD, 0x1234, 0x0001, 0x00, 4);
    requester
        .send_to(&request, ("127.0.0.1", port))
        .await
        .unwrap();

    // The handler saw the request with its header fields intact.
    let received = tokio::task::spawn_blocking(move || {
        request_rx.recv_timeout(Duration::from_secs(2))
    })
    .await
    .unwrap()
    .expect("request dispatched to handler");
    assert_eq!(received.service, SERVICE);
    assert_eq!(received.method, METHOD);
    assert_eq!(received.client, 0x1234);
    assert_eq!(received.session, 0x0001);
    assert_eq!(received.instance, INSTANCE);

    // Answer; the reply route recorded from the request carries it back.
    let response = Message::response_to(&received).with_payload(bytes::Bytes::from_static(&[9, 9]));
    app.send(response, true).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), requester.recv_from(&mut buf))
        .await
        .expect("response within timeout")
        .unwrap();
    assert_eq!(from.port(), port);
    assert_eq!(len, 18);
    assert_eq!(&buf[..2], &SERVICE.to_be_bytes());
    assert_eq!(&buf[8..10], &0x1234u16.to_be_bytes());
    assert_eq!(&buf[10..12], &0x0001u16.to_be_bytes());
    assert_eq!(buf[14], 0x80);
    assert_eq!(&buf[16..18], &[9, 9]);

    app.stop();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn request_with_wrong_interface_version_gets_an_error_response() {
    let port = free_udp_port();
    let config = Config::builder()
        .application_name("udp-rpc-error-test")
        .service(ServiceConfig::new(SERVICE, INSTANCE).unreliable_port(port))
        .build();

    let app = Application::new(config);
    app.init().await.unwrap();
    app.start();
    app.offer_service(SERVICE, INSTANCE, 3, 0).await.unwrap();

    let requester = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Interface version 1 against a major-3 provider.
    let request = build_message(SERVICE, METHOD, 0x0099, 0x0001, 0x00, 0);
    requester
        .send_to(&request, ("127.0.0.1", port))
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), requester.recv_from(&mut buf))
        .await
        .expect("error response within timeout")
        .unwrap();
    assert_eq!(len, 16);
    // ERROR message type, WRONG_INTERFACE_VERSION return code, echoed ids.
    assert_eq!(buf[14], 0x81);
    assert_eq!(buf[15], 0x08);
    assert_eq!(&buf[..2], &SERVICE.to_be_bytes());
    assert_eq!(&buf[8..10], &0x0099u16.to_be_bytes());

    app.stop();
}
