//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use routeip::endpoint::{Destination, EndpointHost, EndpointId};

/// Build a raw SOME/IP message with the given header fields and a payload
/// of `payload_len` filler bytes.
pub fn build_message(
    service: u16,
    method: u16,
    client: u16,
    session: u16,
    message_type: u8,
    payload_len: usize,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(16 + payload_len);
    data.extend_from_slice(&service.to_be_bytes());
    data.extend_from_slice(&method.to_be_bytes());
    data.extend_from_slice(&((8 + payload_len) as u32).to_be_bytes());
    data.extend_from_slice(&client.to_be_bytes());
    data.extend_from_slice(&session.to_be_bytes());
    data.push(0x01); // protocol version
    data.push(0x01); // interface version
    data.push(message_type);
    data.push(0x00); // return code
    data.extend(std::iter::repeat(0x55).take(payload_len));
    data
}

/// Endpoint host that records every delivery.
#[derive(Default)]
pub struct RecordingHost {
    pub messages: Mutex<Vec<(Vec<u8>, Destination)>>,
    pub errors: Mutex<Vec<Vec<u8>>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl EndpointHost for RecordingHost {
    fn on_message(&self, data: &[u8], _receiver: EndpointId, destination: Destination) {
        self.messages.lock().unwrap().push((data.to_vec(), destination));
    }

    fn on_error(&self, data: &[u8], _receiver: EndpointId) {
        self.errors.lock().unwrap().push(data.to_vec());
    }

    fn on_connect(&self, _receiver: EndpointId, _reliable: bool) {}

    fn on_disconnect(&self, _receiver: EndpointId, _reliable: bool) {}
}

/// Poll `predicate` until it holds or the timeout elapses.
pub async fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
