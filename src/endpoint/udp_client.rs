//! UDP client endpoint: unicast lane from this process to one remote provider.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Destination, EndpointHost, EndpointId};
use crate::net::UdpSocket;

/// Client endpoint for unreliable (UDP) traffic to a single remote service
/// endpoint. Responses and unicast notifications from the provider arrive
/// on the same socket and are delivered upward.
pub struct UdpClientEndpoint<U: UdpSocket> {
    id: EndpointId,
    local: SocketAddr,
    remote: SocketAddr,
    socket: Arc<U>,
    host: Weak<dyn EndpointHost>,
    max_message_size: usize,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl<U: UdpSocket> UdpClientEndpoint<U> {
    /// Bind a local socket for traffic to `remote`.
    pub async fn bind(
        local: SocketAddr,
        remote: SocketAddr,
        host: Weak<dyn EndpointHost>,
        max_message_size: usize,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(U::bind(local).await?);
        let local = socket.local_addr()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Self {
            id: EndpointId::next(),
            local,
            remote,
            socket,
            host,
            max_message_size,
            outbound_tx,
            tasks: Mutex::new(Vec::new()),
        });
        endpoint.spawn_sender(outbound_rx);
        Ok(endpoint)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Spawn the receive task. UDP has no handshake, so the endpoint
    /// reports itself connected immediately.
    pub fn start(self: &Arc<Self>) {
        if let Some(host) = self.host.upgrade() {
            host.on_connect(self.id, false);
        }
        let weak = Arc::downgrade(self);
        let socket = Arc::clone(&self.socket);
        let max = self.max_message_size;
        let local = self.local;
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; max];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, _from)) if len > 0 => {
                        let Some(endpoint) = weak.upgrade() else {
                            return;
                        };
                        let Some(host) = endpoint.host.upgrade() else {
                            return;
                        };
                        host.on_message(&buf[..len], endpoint.id, Destination::Unicast(local));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if weak.strong_count() == 0 {
                            return;
                        }
                        tracing::error!("udp client receive error on {}: {}", local, e);
                    }
                }
            }
        })
        .abort_handle();
        self.tasks.lock().expect("task registry poisoned").push(handle);
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task registry poisoned").drain(..) {
            task.abort();
        }
    }

    /// Queue a frame for the remote provider.
    pub fn send(&self, data: &[u8], _flush: bool) -> bool {
        self.outbound_tx.send(Bytes::copy_from_slice(data)).is_ok()
    }

    fn spawn_sender(self: &Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<Bytes>) {
        let socket = Arc::clone(&self.socket);
        let remote = self.remote;
        let handle = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&frame, remote).await {
                    tracing::error!("udp client send to {} failed: {}", remote, e);
                }
            }
        })
        .abort_handle();
        self.tasks.lock().expect("task registry poisoned").push(handle);
    }
}

impl<U: UdpSocket> Drop for UdpClientEndpoint<U> {
    fn drop(&mut self) {
        self.stop();
    }
}
