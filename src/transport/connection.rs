//! # Connection
//!
//! One accepted socket and the two chains that drive it.
//!
//! The read chain decodes frames in wire order and pushes each one, tagged
//! with its origin, into the server's shared inbound queue. The write chain
//! drains the connection's private outbound queue one frame at a time: it
//! takes the oldest message and finishes writing it before taking the next,
//! and a single task owns the write half, so at most one write is ever in
//! flight and frames from concurrent senders never interleave.
//!
//! Both chains run as tasks on the server's runtime and stop as soon as the
//! connection is closed, for whatever reason. Closing is idempotent and
//! reported to the server exactly once through [`Inbox::closed`].

use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::codec::FrameCodec;
use crate::core::message::Message;
use crate::error::{Result, TransportError};
use crate::utils::metrics::Metrics;
use crate::utils::queue::SyncQueue;

/// Server-assigned connection identifier
pub type ConnectionId = u32;

/// An inbound message tagged with the connection that produced it.
///
/// The tag does not keep the connection alive: once the server has dropped
/// it, [`OwnedMessage::origin`] returns `None`.
#[derive(Debug, Clone)]
pub struct OwnedMessage {
    message: Message,
    origin: Weak<Connection>,
    origin_id: ConnectionId,
}

impl OwnedMessage {
    pub fn new(message: Message, origin: Weak<Connection>, origin_id: ConnectionId) -> Self {
        Self {
            message,
            origin,
            origin_id,
        }
    }

    /// The sending connection, if it is still alive
    pub fn origin(&self) -> Option<Arc<Connection>> {
        self.origin.upgrade()
    }

    pub fn origin_id(&self) -> ConnectionId {
        self.origin_id
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Deref for OwnedMessage {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl DerefMut for OwnedMessage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.message
    }
}

/// Mailboxes every connection of a server reports into
#[derive(Debug, Default)]
pub struct Inbox {
    messages: SyncQueue<OwnedMessage>,
    closed: SyncQueue<ConnectionId>,
    metrics: Metrics,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded messages from every connection, in arrival order
    pub fn messages(&self) -> &SyncQueue<OwnedMessage> {
        &self.messages
    }

    /// Ids of connections that have closed since the last reap
    pub fn closed(&self) -> &SyncQueue<ConnectionId> {
        &self.closed
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// A framed TCP connection with an ordered outbound queue
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    // Held until `start` splits it between the two chains
    socket: Mutex<Option<TcpStream>>,
    outbound: SyncQueue<Message>,
    inbox: Arc<Inbox>,
    // Messages pushed to the inbox that the server has not handed out yet
    undelivered: AtomicUsize,
    open: AtomicBool,
    closing: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, inbox: Arc<Inbox>) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        inbox.metrics().connection_established();
        info!(conn_id = id, peer = ?peer_addr, "New connection");

        Arc::new(Self {
            id,
            peer_addr,
            socket: Mutex::new(Some(stream)),
            outbound: SyncQueue::new(),
            inbox,
            undelivered: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            closing: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// True until the connection is closed, locally or by the peer
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Messages queued and not yet taken by the write chain
    pub fn pending_writes(&self) -> usize {
        self.outbound.len()
    }

    /// Inbound messages from this connection still waiting in the inbox
    pub fn undelivered(&self) -> usize {
        self.undelivered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_delivered(&self) {
        let _ = self
            .undelivered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Split the socket and spawn the read and write chains on the current
    /// runtime. Does nothing if already started or already closed.
    pub fn start(self: &Arc<Self>, codec: FrameCodec) {
        if !self.is_connected() {
            return;
        }

        let stream = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(stream) = stream else {
            warn!(conn_id = self.id, "Connection already started");
            return;
        };

        let (reader, writer) = stream.into_split();
        tokio::spawn(
            self.clone()
                .read_chain(FramedRead::new(reader, codec.clone())),
        );
        tokio::spawn(self.clone().write_chain(FramedWrite::new(writer, codec)));
    }

    /// Queue a message for this connection. Safe to call from any thread.
    ///
    /// The push also wakes the write chain if it is idle; both happen under
    /// the outbound queue's lock, so concurrent senders cannot start two
    /// writers or lose a wake-up.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        self.outbound.push_back(message);
        Ok(())
    }

    /// Close the socket if it is still open
    pub fn disconnect(&self) {
        if self.is_connected() {
            info!(conn_id = self.id, "Disconnecting");
            self.close();
        }
    }

    /// Mark closed and stop both chains; their socket halves are dropped
    /// as they exit, and a socket that was never started is dropped here.
    /// Returns whether this call did the closing.
    fn close(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }

        let unstarted = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(unstarted);

        self.closing.cancel();
        self.inbox.metrics().connection_closed();
        self.inbox.closed().push_back(self.id);
        true
    }

    #[instrument(name = "read_chain", skip_all, fields(conn_id = self.id))]
    async fn read_chain(self: Arc<Self>, mut frames: FramedRead<OwnedReadHalf, FrameCodec>) {
        let origin = Arc::downgrade(&self);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break,
                next = frames.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    trace!(
                        type_id = message.type_id(),
                        body_size = message.body_size(),
                        "Message received"
                    );
                    self.inbox
                        .metrics()
                        .message_received(message.wire_len() as u64);
                    self.undelivered.fetch_add(1, Ordering::AcqRel);
                    self.inbox
                        .messages()
                        .push_back(OwnedMessage::new(message, origin.clone(), self.id));
                }
                None => {
                    debug!("Peer closed the stream");
                    break;
                }
                Some(Err(TransportError::Io(e))) => {
                    self.inbox.metrics().connection_error();
                    error!(error = %e, "Unable to read message");
                    break;
                }
                Some(Err(e)) => {
                    self.inbox.metrics().protocol_error();
                    error!(error = %e, "Unable to decode message");
                    break;
                }
            }
        }

        self.close();
    }

    #[instrument(name = "write_chain", skip_all, fields(conn_id = self.id))]
    async fn write_chain<W>(self: Arc<Self>, mut sink: FramedWrite<W, FrameCodec>)
    where
        W: AsyncWrite + Unpin,
    {
        'chain: loop {
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => break 'chain,
                _ = self.outbound.wait_non_empty() => {}
            }

            while let Ok(message) = self.outbound.pop_front() {
                let type_id = message.type_id();
                let wire_len = message.wire_len() as u64;

                let written = tokio::select! {
                    biased;
                    _ = self.closing.cancelled() => break 'chain,
                    written = sink.send(message) => written,
                };

                match written {
                    Ok(()) => {
                        trace!(type_id, "Message sent");
                        self.inbox.metrics().message_sent(wire_len);
                    }
                    Err(e @ TransportError::OversizedBody(_)) => {
                        // Rejected before any byte hit the socket; skip it
                        self.inbox.metrics().protocol_error();
                        error!(type_id, error = %e, "Dropping unsendable message");
                    }
                    Err(e) => {
                        self.inbox.metrics().connection_error();
                        error!(type_id, error = %e, "Unable to write message");
                        self.close();
                        break 'chain;
                    }
                }
            }
        }

        self.outbound.clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(conn_id = self.id, "Connection released");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::task::JoinSet;

    /// Accept one loopback connection, returning (server side, client side)
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    async fn unstarted(id: ConnectionId) -> (Arc<Connection>, Arc<Inbox>, TcpStream) {
        let (server_side, client) = socket_pair().await;
        let inbox = Arc::new(Inbox::new());
        let conn = Connection::new(id, server_side, inbox.clone());
        (conn, inbox, client)
    }

    async fn started(id: ConnectionId) -> (Arc<Connection>, Arc<Inbox>, TcpStream) {
        let (conn, inbox, client) = unstarted(id).await;
        conn.start(FrameCodec::default());
        (conn, inbox, client)
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_sender_fifo() {
        let (conn, _inbox, client) = started(1000).await;

        for i in 0..200 {
            let mut msg = Message::new(7);
            msg.push_int(i);
            conn.send(msg).unwrap();
        }

        let mut frames = FramedRead::new(client, FrameCodec::default());
        for expected in 0..200 {
            let mut msg = frames.next().await.unwrap().unwrap();
            assert_eq!(msg.type_id(), 7);
            assert_eq!(msg.pop_int().unwrap(), expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_never_interleave() {
        let (conn, inbox, client) = started(1000).await;
        let senders = 8;
        let per_sender = 250;

        let mut tasks = JoinSet::new();
        for sender in 0..senders {
            let conn = conn.clone();
            tasks.spawn_blocking(move || {
                for seq in 0..per_sender {
                    let mut msg = Message::new(sender as u32);
                    msg.push_int(sender);
                    msg.push_int(seq);
                    // Padding makes a torn frame show up as a decode mismatch
                    msg.push_int(-1);
                    conn.send(msg).unwrap();
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        let mut frames = FramedRead::new(client, FrameCodec::default());
        let mut next_seq = vec![0; senders as usize];
        for _ in 0..senders * per_sender {
            let mut msg = frames.next().await.unwrap().unwrap();
            assert_eq!(msg.body_size(), 12);
            assert_eq!(msg.pop_int().unwrap(), -1);
            let seq = msg.pop_int().unwrap();
            let sender = msg.pop_int().unwrap();
            assert_eq!(msg.type_id(), sender as u32);
            assert_eq!(seq, next_seq[sender as usize]);
            next_seq[sender as usize] += 1;
        }

        assert!(next_seq.iter().all(|&n| n == per_sender));
        let total = (senders * per_sender) as u64;
        wait_until("sent counter", || inbox.metrics().snapshot().messages_sent == total).await;
        assert_eq!(conn.pending_writes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inbound_messages_are_tagged() {
        let (conn, inbox, mut client) = started(1234).await;

        let mut first = Message::new(1);
        first.push_int(11);
        let empty = Message::new(2);
        client.write_all(&first.encode()).await.unwrap();
        client.write_all(&empty.encode()).await.unwrap();

        wait_until("two inbound messages", || inbox.messages().len() == 2).await;

        let mut received = inbox.messages().pop_front().unwrap();
        assert_eq!(received.origin_id(), 1234);
        assert!(Arc::ptr_eq(&received.origin().unwrap(), &conn));
        assert_eq!(received.pop_int().unwrap(), 11);

        let received = inbox.messages().pop_front().unwrap();
        assert_eq!(received.type_id(), 2);
        assert_eq!(received.body_size(), 0);

        assert_eq!(conn.undelivered(), 2);
        conn.mark_delivered();
        conn.mark_delivered();
        conn.mark_delivered();
        assert_eq!(conn.undelivered(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_origin_does_not_keep_connection_alive() {
        let (conn, inbox, mut client) = started(1000).await;
        client.write_all(&Message::new(1).encode()).await.unwrap();
        wait_until("inbound message", || !inbox.messages().is_empty()).await;

        drop(client);
        wait_until("close", || !conn.is_connected()).await;
        let message = inbox.messages().pop_front().unwrap();
        drop(conn);

        // The chains hold the connection briefly after closing
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while message.origin().is_some() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clean_eof_closes_once() {
        let (conn, inbox, client) = started(1000).await;
        drop(client);

        wait_until("close", || !conn.is_connected()).await;
        assert_eq!(inbox.closed().pop_front().unwrap(), 1000);

        conn.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inbox.closed().is_empty());

        let snapshot = inbox.metrics().snapshot();
        assert_eq!(snapshot.connection_errors, 0);
        assert_eq!(snapshot.connections_active, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eof_mid_frame_is_an_error() {
        let (conn, inbox, mut client) = started(1000).await;
        client.write_all(&[1, 0, 0, 0, 8, 0, 0, 0, 1]).await.unwrap();
        client.shutdown().await.unwrap();

        wait_until("close", || !conn.is_connected()).await;
        assert_eq!(inbox.metrics().snapshot().connection_errors, 1);
        assert!(inbox.messages().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_rejects_sends_and_closes_socket() {
        let (conn, inbox, client) = started(1000).await;
        conn.disconnect();

        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(Message::new(1)),
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(inbox.closed().pop_front().unwrap(), 1000);

        let mut frames = FramedRead::new(client, FrameCodec::default());
        let next = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("peer should observe the close");
        assert!(next.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_outbound_is_dropped_and_connection_stays_open() {
        let (conn, inbox, _client) = unstarted(1000).await;
        let (near, far) = tokio::io::duplex(1024);
        tokio::spawn(conn.clone().write_chain(FramedWrite::new(near, FrameCodec::new(8))));

        let mut big = Message::new(1);
        for v in [1, 2, 3] {
            big.push_int(v);
        }
        let mut small = Message::new(2);
        small.push_int(9);
        conn.send(big).unwrap();
        conn.send(small).unwrap();

        let mut frames = FramedRead::new(far, FrameCodec::default());
        let mut msg = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("small message should be written")
            .unwrap()
            .unwrap();
        assert_eq!(msg.type_id(), 2);
        assert_eq!(msg.pop_int().unwrap(), 9);
        assert!(msg.is_empty());

        assert!(conn.is_connected());
        assert!(inbox.closed().is_empty());
        let snapshot = inbox.metrics().snapshot();
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.messages_sent, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_failure_closes_once() {
        let (conn, inbox, _client) = unstarted(1000).await;
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        tokio::spawn(conn.clone().write_chain(FramedWrite::new(near, FrameCodec::default())));

        let mut msg = Message::new(1);
        msg.push_int(5);
        // Keep sending until the writer notices the broken pipe
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while conn.send(msg.clone()).is_ok() {
            assert!(tokio::time::Instant::now() < deadline, "write never failed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!conn.is_connected());
        assert_eq!(inbox.closed().pop_front().unwrap(), 1000);
        assert!(inbox.closed().is_empty());
        assert_eq!(inbox.metrics().snapshot().connection_errors, 1);
        wait_until("outbound cleared", || conn.pending_writes() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_before_start_closes_socket() {
        let (conn, inbox, client) = unstarted(1000).await;
        conn.disconnect();
        assert_eq!(inbox.closed().pop_front().unwrap(), 1000);

        // The connection is still referenced, yet the peer sees the close
        let mut frames = FramedRead::new(client, FrameCodec::default());
        let next = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("peer should observe the close");
        assert!(next.is_none());

        conn.start(FrameCodec::default());
        assert!(!conn.is_connected());
    }
}
