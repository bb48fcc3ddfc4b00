//! TCP server endpoint: accept loop and per-connection stream framing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{
    extract_stream_messages, Destination, EndpointDefinition, EndpointHost, EndpointId,
};
use crate::wire;
use crate::{ClientId, SessionId};

use crate::net::{TcpListener, TcpStream};

/// Server endpoint for reliable (TCP) traffic.
///
/// Accepted connections each run one task that frames the byte stream with
/// the SOME/IP length field and writes queued outbound frames. Reply
/// routing works as for UDP: request-class messages record their peer under
/// `(client, session)`, responses look the peer up again.
pub struct TcpServerEndpoint<L: TcpListener> {
    id: EndpointId,
    local: SocketAddr,
    listener: Arc<L>,
    host: Weak<dyn EndpointHost>,
    max_message_size: usize,
    clients: Mutex<HashMap<ClientId, HashMap<SessionId, SocketAddr>>>,
    /// Lock-free map: written by the accept loop, read by every send.
    connections: DashMap<SocketAddr, Connection>,
    accept_task: Mutex<Option<AbortHandle>>,
}

struct Connection {
    tx: mpsc::UnboundedSender<Bytes>,
    task: AbortHandle,
}

impl<L: TcpListener> TcpServerEndpoint<L> {
    /// Bind the listener. `start` must be called to begin accepting.
    pub async fn bind(
        local: SocketAddr,
        host: Weak<dyn EndpointHost>,
        max_message_size: usize,
    ) -> std::io::Result<Arc<Self>> {
        let listener = Arc::new(L::bind(local).await?);
        let local = listener.local_addr()?;
        Ok(Arc::new(Self {
            id: EndpointId::next(),
            local,
            listener,
            host,
            max_message_size,
            clients: Mutex::new(HashMap::new()),
            connections: DashMap::new(),
            accept_task: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    /// Spawn the accept loop.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let listener = Arc::clone(&self.listener);
        let local = self.local;
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let Some(endpoint) = weak.upgrade() else {
                            return;
                        };
                        endpoint.register_connection(stream, peer);
                    }
                    Err(e) => {
                        if weak.strong_count() == 0 {
                            return;
                        }
                        tracing::error!("tcp accept error on {}: {}", local, e);
                    }
                }
            }
        })
        .abort_handle();
        *self.accept_task.lock().expect("accept task slot poisoned") = Some(handle);
    }

    /// Stop accepting and drop every connection.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task slot poisoned").take() {
            task.abort();
        }
        for entry in self.connections.iter() {
            entry.value().task.abort();
        }
        self.connections.clear();
    }

    fn register_connection(self: &Arc<Self>, stream: L::Stream, peer: SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        let max = self.max_message_size;
        let task = tokio::spawn(async move {
            connection_task(stream, peer, rx, weak.clone(), max).await;
            if let Some(endpoint) = weak.upgrade() {
                endpoint.drop_connection(peer);
            }
        })
        .abort_handle();
        self.connections.insert(peer, Connection { tx, task });
    }

    fn drop_connection(&self, peer: SocketAddr) {
        if self.connections.remove(&peer).is_some() {
            if let Some(host) = self.host.upgrade() {
                host.on_disconnect(self.id, true);
            }
        }
    }

    /// Record a reply route observed by a connection task.
    fn record_client(&self, client: ClientId, session: SessionId, peer: SocketAddr) {
        self.clients
            .lock()
            .expect("reply map poisoned")
            .entry(client)
            .or_default()
            .insert(session, peer);
    }

    /// Queue `data` for the connection from `target`, if one exists. A
    /// server never connects out; without an established connection the
    /// send is dropped and logged.
    pub fn send_to(&self, target: &EndpointDefinition, data: &[u8], _flush: bool) -> bool {
        let peer = target.socket_addr();
        match self.connections.get(&peer) {
            Some(connection) => connection.tx.send(Bytes::copy_from_slice(data)).is_ok(),
            None => {
                tracing::warn!("no tcp connection to {} for outbound frame", peer);
                false
            }
        }
    }

    /// Send a response over the connection the matching request came from.
    pub fn send(&self, data: &[u8], flush: bool) -> bool {
        let (Some(client), Some(session)) = (wire::peek_client(data), wire::peek_session(data))
        else {
            return false;
        };
        let Some(peer) = self.reply_target(client, session) else {
            tracing::warn!(
                "no reply route for client {:04x} session {:04x}",
                client,
                session
            );
            return false;
        };
        self.send_to(&EndpointDefinition::new(peer.ip(), peer.port(), true), data, flush)
    }

    /// Recorded reply route for a `(client, session)` pair.
    pub fn reply_target(&self, client: ClientId, session: SessionId) -> Option<SocketAddr> {
        self.clients
            .lock()
            .expect("reply map poisoned")
            .get(&client)
            .and_then(|sessions| sessions.get(&session))
            .copied()
    }

    /// Find the client id that last sent a request from `endpoint`.
    pub fn get_client(&self, endpoint: &EndpointDefinition) -> ClientId {
        let target = endpoint.socket_addr();
        let clients = self.clients.lock().expect("reply map poisoned");
        for (client, sessions) in clients.iter() {
            if sessions.values().any(|remote| *remote == target) {
                return *client;
            }
        }
        0
    }
}

impl<L: TcpListener> Drop for TcpServerEndpoint<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-connection task: frames inbound bytes, writes outbound frames.
/// Returns when the peer closes, a read/write fails, or the stream is
/// poisoned by an unframeable length field.
async fn connection_task<S: TcpStream, L: TcpListener<Stream = S>>(
    mut stream: S,
    peer: SocketAddr,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    endpoint: Weak<TcpServerEndpoint<L>>,
    max_message_size: usize,
) {
    let local = stream.local_addr().ok();
    let destination = Destination::Unicast(local.unwrap_or(peer));
    let mut buffer = BytesMut::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        tokio::select! {
            result = stream.read(&mut chunk) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("tcp connection from {} closed", peer);
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
                            |frame| {
                                if wire::is_request(frame[wire::MESSAGE_TYPE_POS]) {
                                    if let (Some(client), Some(session)) =
                                        (wire::peek_client(&frame), wire::peek_session(&frame))
                                    {
                                        endpoint.record_client(client, session, peer);
                                    }
                                }
                                host.on_message(&frame, endpoint.id, destination);
                            },
                        );
                        if let Err(e) = framed {
                            tracing::error!(
                                "dropping tcp connection from {}: unframeable length field ({:?})",
                                peer,
                                e
                            );
                            host.on_error(&buffer, endpoint.id);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!("tcp read error from {}: {}", peer, e);
                        return;
                    }
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    return;
                };
                if let Err(e) = stream.write_all(&frame).await {
                    tracing::error!("tcp write to {} failed: {}", peer, e);
                    return;
                }
            }
        }
    }
}
