//! TCP client endpoint: connection from this process to one remote provider.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{extract_stream_messages, Destination, EndpointHost, EndpointId};
use crate::net::TcpStream;

/// Client endpoint for reliable (TCP) traffic to a single remote service
/// endpoint. The connection is opened on the first send and reopened on
/// the next send after a failure; frames queued while disconnected are
/// flushed in order once the connection stands.
pub struct TcpClientEndpoint<S: TcpStream> {
    id: EndpointId,
    remote: SocketAddr,
    host: Weak<dyn EndpointHost>,
    max_message_size: usize,
    inner: Mutex<ClientInner>,
    _marker: std::marker::PhantomData<fn() -> S>,
}

struct ClientInner {
    sender: Option<mpsc::UnboundedSender<Bytes>>,
    pending: VecDeque<Bytes>,
    connecting: bool,
    task: Option<AbortHandle>,
}

impl<S: TcpStream> TcpClientEndpoint<S> {
    pub fn new(
        remote: SocketAddr,
        host: Weak<dyn EndpointHost>,
        max_message_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId::next(),
            remote,
            host,
            max_message_size,
            inner: Mutex::new(ClientInner {
                sender: None,
                pending: VecDeque::new(),
                connecting: false,
                task: None,
            }),
            _marker: std::marker::PhantomData,
        })
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Begin connecting. Safe to call repeatedly.
    pub fn start(self: &Arc<Self>) {
        self.ensure_connected();
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("client state poisoned");
        inner.sender = None;
        inner.pending.clear();
        inner.connecting = false;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
    }

    /// Queue a frame for the remote provider, connecting first if needed.
    pub fn send(self: &Arc<Self>, data: &[u8], _flush: bool) -> bool {
        let mut frame = Bytes::copy_from_slice(data);
        {
            let mut inner = self.inner.lock().expect("client state poisoned");
            if let Some(tx) = &inner.sender {
                match tx.send(frame) {
                    Ok(()) => return true,
                    Err(rejected) => {
                        // Connection task went away; reconnect below.
                        inner.sender = None;
                        frame = rejected.0;
                    }
                }
            }
            inner.pending.push_back(frame);
        }
        self.ensure_connected();
        true
    }

    fn ensure_connected(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("client state poisoned");
            if inner.sender.is_some() || inner.connecting {
                return;
            }
            inner.connecting = true;
        }
        let weak = Arc::downgrade(self);
        let remote = self.remote;
        let max = self.max_message_size;
        let handle = tokio::spawn(async move {
            let stream = match S::connect(remote).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("tcp connect to {} failed: {}", remote, e);
                    if let Some(endpoint) = weak.upgrade() {
                        let mut inner = endpoint.inner.lock().expect("client state poisoned");
                        inner.connecting = false;
                        inner.pending.clear();
                    }
                    return;
                }
            };

            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(endpoint) = weak.upgrade() {
                let mut inner = endpoint.inner.lock().expect("client state poisoned");
                for frame in inner.pending.drain(..) {
                    let _ = tx.send(frame);
                }
                inner.sender = Some(tx);
                inner.connecting = false;
                drop(inner);
                if let Some(host) = endpoint.host.upgrade() {
                    host.on_connect(endpoint.id, true);
                }
            } else {
                return;
            }

            connection_loop::<S>(stream, remote, rx, weak.clone(), max).await;

            if let Some(endpoint) = weak.upgrade() {
                let mut inner = endpoint.inner.lock().expect("client state poisoned");
                inner.sender = None;
                inner.task = None;
                drop(inner);
                if let Some(host) = endpoint.host.upgrade() {
                    host.on_disconnect(endpoint.id, true);
                }
            }
        })
        .abort_handle();
        self.inner.lock().expect("client state poisoned").task = Some(handle);
    }
}

impl<S: TcpStream> Drop for TcpClientEndpoint<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read/write loop for an established client connection. Returns on EOF,
/// I/O error, or a poisoned length field.
async fn connection_loop<S: TcpStream>(
    mut stream: S,
    remote: SocketAddr,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    endpoint: Weak<TcpClientEndpoint<S>>,
    max_message_size: usize,
) {
    let destination = Destination::Unicast(stream.local_addr().unwrap_or(remote));
    let mut buffer = BytesMut::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        tokio::select! {
            result = stream.read(&mut chunk) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("tcp connection to {} closed by peer", remote);
                        return;
                    }
                    Ok(len) => {
                        buffer.extend_from_slice(&chunk[..len]);
                        let Some(endpoint) = endpoint.upgrade() else {
                            return;
                        };
                        let Some(host) = endpoint.host.upgrade() else {
                            return;
                        };
                        let framed = extract_stream_messages(
                            &mut buffer,
                            max_message_size,
                            |frame| host.on_message(&frame, endpoint.id, destination),
                        );
                        if let Err(e) = framed {
                            tracing::error!(
                                "dropping tcp connection to {}: unframeable length field ({:?})",
                                remote,
                                e
                            );
                            host.on_error(&buffer, endpoint.id);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!("tcp read error from {}: {}", remote, e);
                        return;
                    }
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return;
                };
                if let Err(e) = stream.write_all(&frame).await {
                    tracing::error!("tcp write to {} failed: {}", remote, e);
                    return;
                }
            }
        }
    }
}
