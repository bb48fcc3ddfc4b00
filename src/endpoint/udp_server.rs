//! UDP server endpoint: datagram framing, multicast membership, reply routing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Destination, EndpointDefinition, EndpointHost, EndpointId};
use crate::net::UdpSocket;
use crate::wire;
use crate::{ClientId, SessionId};

/// Server endpoint for unreliable (UDP) traffic.
///
/// One instance owns one bound socket. A receive task keeps a single
/// receive outstanding and splits each datagram into SOME/IP messages; a
/// send task drains the outbound queue so sends to any destination are
/// strict FIFO. Joined multicast groups each get their own receiver socket
/// bound to the same port, which is what identifies the destination of a
/// delivery as the group (the portable stand-in for IP_PKTINFO).
pub struct UdpServerEndpoint<U: UdpSocket> {
    id: EndpointId,
    local: SocketAddr,
    socket: Arc<U>,
    host: Weak<dyn EndpointHost>,
    max_message_size: usize,
    /// Reply routes recorded from incoming requests. Guarded separately:
    /// written on the receive path, read on the send path.
    clients: Mutex<HashMap<ClientId, HashMap<SessionId, SocketAddr>>>,
    /// Joined multicast groups and their receiver tasks.
    joined: Mutex<HashMap<Ipv4Addr, AbortHandle>>,
    /// Partially assembled (non-flushed) frames per destination.
    pending: Mutex<HashMap<SocketAddr, BytesMut>>,
    outbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl<U: UdpSocket> UdpServerEndpoint<U> {
    /// Bind the endpoint. `start` must be called to begin receiving.
    pub async fn bind(
        local: SocketAddr,
        host: Weak<dyn EndpointHost>,
        max_message_size: usize,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(U::bind(local).await?);
        let local = socket.local_addr()?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Self {
            id: EndpointId::next(),
            local,
            socket,
            host,
            max_message_size,
            clients: Mutex::new(HashMap::new()),
            joined: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
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

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    /// Spawn the receive task. One receive is outstanding at a time; socket
    /// errors re-arm the receive without tearing the endpoint down.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let socket = Arc::clone(&self.socket);
        let max = self.max_message_size;
        let local = self.local;
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; max];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, remote)) if len > 0 => {
                        let Some(endpoint) = weak.upgrade() else {
                            return;
                        };
                        endpoint.handle_datagram(
                            &buf[..len],
                            remote,
                            Destination::Unicast(local),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if weak.strong_count() == 0 {
                            return;
                        }
                        tracing::error!("udp receive error on {}: {}", local, e);
                    }
                }
            }
        })
        .abort_handle();
        self.tasks.lock().expect("task registry poisoned").push(handle);
    }

    /// Stop I/O: abort the receive/send tasks and every multicast receiver.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task registry poisoned").drain(..) {
            task.abort();
        }
        for (_, task) in self.joined.lock().expect("joined set poisoned").drain() {
            task.abort();
        }
    }

    /// Split a datagram into SOME/IP messages and deliver them upward.
    ///
    /// Reply routes are recorded for request-class messages before
    /// delivery. An SD message must fill the remainder of the datagram;
    /// an SD message followed by trailing bytes discards the whole rest.
    /// A bad length field reports the remainder via `on_error` (unless it
    /// claims to be SD) and discards it.
    pub fn handle_datagram(&self, data: &[u8], remote: SocketAddr, destination: Destination) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let mut i = 0usize;
        let mut remaining = data.len();
        while remaining > 0 {
            let size = wire::get_message_size(&data[i..]);
            if size > wire::LENGTH_PREFIX_SIZE && size <= remaining {
                let message = &data[i..i + size];
                if wire::is_request(message[wire::MESSAGE_TYPE_POS]) {
                    if let (Some(client), Some(session)) =
                        (wire::peek_client(message), wire::peek_session(message))
                    {
                        // Last writer wins for a reused (client, session).
                        self.clients
                            .lock()
                            .expect("reply map poisoned")
                            .entry(client)
                            .or_default()
                            .insert(session, remote);
                    }
                }
                let service = wire::peek_service(message);
                if service != Some(wire::SD_SERVICE_ID) || size == remaining {
                    host.on_message(message, self.id, destination);
                } else {
                    tracing::error!(
                        "received an unreliable SD message with too short length field from {}",
                        remote
                    );
                    return;
                }
                i += size;
                remaining -= size;
            } else {
                tracing::error!(
                    "received an unreliable message with bad length field from {}",
                    remote
                );
                if wire::peek_service(&data[i..]) != Some(wire::SD_SERVICE_ID) {
                    host.on_error(&data[i..], self.id);
                }
                return;
            }
        }
    }

    /// Queue `data` for `target`. With `flush` false the bytes are held
    /// back and prepended to the next send to the same target.
    pub fn send_to(&self, target: &EndpointDefinition, data: &[u8], flush: bool) -> bool {
        self.send_intern(target.socket_addr(), data, flush)
    }

    /// Send a response: the destination is looked up from the reply route
    /// recorded when the matching request arrived.
    pub fn send(&self, data: &[u8], flush: bool) -> bool {
        let (Some(client), Some(session)) = (wire::peek_client(data), wire::peek_session(data))
        else {
            return false;
        };
        let Some(target) = self.reply_target(client, session) else {
            tracing::warn!(
                "no reply route for client {:04x} session {:04x}",
                client,
                session
            );
            return false;
        };
        self.send_intern(target, data, flush)
    }

    fn send_intern(&self, target: SocketAddr, data: &[u8], flush: bool) -> bool {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        if !flush {
            pending
                .entry(target)
                .or_default()
                .extend_from_slice(data);
            return true;
        }
        let frame = match pending.remove(&target) {
            Some(mut held) => {
                held.extend_from_slice(data);
                held.freeze()
            }
            None => Bytes::copy_from_slice(data),
        };
        drop(pending);
        self.outbound_tx.send((target, frame)).is_ok()
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
    ///
    /// The id is returned exactly as carried in the wire header: the reply
    /// map stores ids parsed with big-endian semantics, so no byte swap is
    /// needed on any host.
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

    // ------------------------------------------------------------------
    // Multicast membership
    // ------------------------------------------------------------------

    /// Whether `group` is currently joined.
    pub fn is_joined(&self, group: Ipv4Addr) -> bool {
        self.joined
            .lock()
            .expect("joined set poisoned")
            .contains_key(&group)
    }

    /// Idempotently join a multicast group. A dedicated receiver socket is
    /// bound to the endpoint's port and joined to the group, so deliveries
    /// from it are known to be addressed to the group. Failures are logged,
    /// not propagated.
    pub async fn join(self: &Arc<Self>, group: Ipv4Addr) {
        if self.is_joined(group) {
            return;
        }
        let port = self.local.port();
        let bind_addr = SocketAddr::new(IpAddr::from(Ipv4Addr::UNSPECIFIED), port);
        let socket = match U::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!("multicast bind for {} failed: {}", group, e);
                return;
            }
        };
        if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
            tracing::error!("joining multicast group {} failed: {}", group, e);
            return;
        }

        let weak = Arc::downgrade(self);
        let max = self.max_message_size;
        let destination = Destination::Multicast(SocketAddr::new(IpAddr::from(group), port));
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; max];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, remote)) if len > 0 => {
                        let Some(endpoint) = weak.upgrade() else {
                            return;
                        };
                        endpoint.handle_datagram(&buf[..len], remote, destination);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if weak.strong_count() == 0 {
                            return;
                        }
                        tracing::error!("multicast receive error for {}: {}", group, e);
                    }
                }
            }
        })
        .abort_handle();

        self.joined
            .lock()
            .expect("joined set poisoned")
            .insert(group, handle);
    }

    /// Leave a multicast group previously joined. Idempotent.
    pub fn leave(&self, group: Ipv4Addr) {
        if let Some(task) = self.joined.lock().expect("joined set poisoned").remove(&group) {
            task.abort();
            if let Err(e) = self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                tracing::debug!("leaving multicast group {}: {}", group, e);
            }
        }
    }

    fn spawn_sender(self: &Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        let socket = Arc::clone(&self.socket);
        let local = self.local;
        let handle = tokio::spawn(async move {
            while let Some((target, frame)) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&frame, target).await {
                    tracing::error!("udp send from {} to {} failed: {}", local, target, e);
                }
            }
        })
        .abort_handle();
        self.tasks.lock().expect("task registry poisoned").push(handle);
    }
}

impl<U: UdpSocket> Drop for UdpServerEndpoint<U> {
    fn drop(&mut self) {
        self.stop();
    }
}
