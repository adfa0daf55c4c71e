//! One framed stream driven by a dedicated reader task and writer task.
//!
//! Only the reader task touches the read half and only the writer task touches
//! the write half. Callers hand payloads to [`Connection::send`], which queues
//! them without blocking; the writer drains the queue in FIFO order, one frame
//! per payload, so concurrent senders never interleave bytes.
//!
//! Payloads queued with [`Connection::send_lossy`] may be discarded when a
//! bounded queue fills up under [`OverflowPolicy::DropOldest`]; payloads
//! queued with [`Connection::send`] are only ever lost together with the
//! connection.
//!
//! Whichever side notices the end first (peer EOF, transport error, queue
//! overflow, local close) wins a compare-and-swap on the closed flag. The
//! winner stops both tasks and notifies the observer; everyone else is a no-op.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, TransportError};
use crate::bridge::protocol::ProtocolError;

pub type ConnectionId = u64;

/// What happens when a bounded outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Close the connection. A peer that cannot keep up is treated as gone.
    #[default]
    Disconnect,
    /// Discard the oldest queued lossy payload to make room. With none
    /// queued, a lossy payload is discarded and any other closes the
    /// connection as with `Disconnect`.
    DropOldest,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest frame accepted or sent, in bytes.
    pub max_frame_length: usize,
    /// Outbound queue bound. `None` queues without limit.
    pub max_pending: Option<usize>,
    pub overflow: OverflowPolicy,
    /// How long the writer keeps flushing queued frames after a close.
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_pending: None,
            overflow: OverflowPolicy::default(),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending.map(|limit| limit.max(1));
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// Why a connection ended.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the stream")]
    PeerClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("outbound queue overflowed")]
    QueueOverflow,

    #[error("closed locally")]
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("payload of {len} bytes exceeds frame limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },
}

/// Receives inbound frames and the single close notification of a connection.
///
/// Called from the connection's reader task (or whichever task closes it), so
/// implementations must not block.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_message(&self, id: ConnectionId, payload: Bytes);
    fn on_close(&self, id: ConnectionId, reason: CloseReason);
}

/// Connection callbacks turned into channel messages.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message { id: ConnectionId, payload: Bytes },
    Closed { id: ConnectionId, reason: CloseReason },
}

/// Observer that forwards everything to an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_message(&self, id: ConnectionId, payload: Bytes) {
        let _ = self.tx.send(ConnectionEvent::Message { id, payload });
    }

    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        let _ = self.tx.send(ConnectionEvent::Closed { id, reason });
    }
}

struct Outbound {
    payload: Bytes,
    lossy: bool,
}

struct Shared {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    config: ConnectionConfig,
    queue: StdMutex<VecDeque<Outbound>>,
    wake: Notify,
    closed: AtomicBool,
    stop: CancellationToken,
    observer: Arc<dyn ConnectionObserver>,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self) -> VecDeque<Outbound> {
        std::mem::take(&mut *self.lock_queue())
    }

    /// Returns true for the single caller that actually closed the connection.
    fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.stop.cancel();
        tracing::debug!(conn_id = self.id, %reason, "Connection closed");
        self.observer.on_close(self.id, reason);
        true
    }
}

/// A connection whose tasks have not been spawned yet.
///
/// Lets the owner publish a [`Connection`] handle (e.g. into a registry)
/// before any inbound frame can reach the observer.
pub struct PendingConnection {
    shared: Arc<Shared>,
}

impl PendingConnection {
    pub fn handle(&self) -> Connection {
        Connection {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Split the stream and spawn the reader and writer onto `tasks`.
    pub fn start<S>(self, stream: S, tasks: &TaskTracker) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let limit = self.shared.config.max_frame_length;
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, FrameCodec::with_max_frame_length(limit));
        let writer = FramedWrite::new(write_half, FrameCodec::with_max_frame_length(limit));

        tasks.spawn(read_loop(Arc::clone(&self.shared), reader));
        tasks.spawn(write_loop(Arc::clone(&self.shared), writer));

        Connection {
            shared: self.shared,
        }
    }
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        config: ConnectionConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> PendingConnection {
        PendingConnection {
            shared: Arc::new(Shared {
                id,
                peer,
                config,
                queue: StdMutex::new(VecDeque::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                stop: CancellationToken::new(),
                observer,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of payloads queued but not yet handed to the socket.
    pub fn pending(&self) -> usize {
        self.shared.lock_queue().len()
    }

    /// Queue one payload to be written as one frame. Never blocks.
    ///
    /// The payload is never discarded on overflow: if it does not fit, the
    /// connection closes.
    pub fn send(&self, payload: Bytes) -> Result<(), ConnectionError> {
        self.enqueue(payload, false)
    }

    /// Like [`send`](Self::send), but the payload may be discarded when the
    /// queue is full and the overflow policy is `DropOldest`.
    pub fn send_lossy(&self, payload: Bytes) -> Result<(), ConnectionError> {
        self.enqueue(payload, true)
    }

    fn enqueue(&self, payload: Bytes, lossy: bool) -> Result<(), ConnectionError> {
        let shared = &self.shared;
        if self.is_closed() {
            return Err(ConnectionError::Closed(shared.id));
        }

        let limit = shared.config.max_frame_length;
        if payload.len() > limit {
            return Err(ConnectionError::TooLarge {
                len: payload.len(),
                limit,
            });
        }

        let overflowed = {
            let mut queue = shared.lock_queue();
            let entry = Outbound { payload, lossy };
            match shared.config.max_pending {
                Some(max) if queue.len() >= max => match shared.config.overflow {
                    OverflowPolicy::Disconnect => true,
                    OverflowPolicy::DropOldest => {
                        match queue.iter().position(|queued| queued.lossy) {
                            Some(oldest) => {
                                queue.remove(oldest);
                                queue.push_back(entry);
                                tracing::warn!(conn_id = shared.id, max, "Outbound queue full, dropped oldest lossy frame");
                                false
                            }
                            None if lossy => {
                                tracing::warn!(conn_id = shared.id, max, "Outbound queue full, dropped lossy frame");
                                false
                            }
                            None => true,
                        }
                    }
                },
                _ => {
                    queue.push_back(entry);
                    false
                }
            }
        };

        if overflowed {
            shared.close(CloseReason::QueueOverflow);
            return Err(ConnectionError::Closed(shared.id));
        }

        shared.wake.notify_one();
        Ok(())
    }

    /// Close locally. Returns false if the connection was already closed.
    pub fn close(&self) -> bool {
        self.shared.close(CloseReason::Local)
    }

    pub fn close_with(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    /// Resolves once the connection has been closed by any party.
    pub async fn closed(&self) {
        self.shared.stop.cancelled().await
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        tokio::select! {
            biased;

            _ = shared.stop.cancelled() => break None,

            frame = reader.next() => match frame {
                Some(Ok(payload)) => shared.observer.on_message(shared.id, payload),
                Some(Err(e)) => break Some(CloseReason::Transport(e)),
                None => break Some(CloseReason::PeerClosed),
            },
        }
    };

    if let Some(reason) = reason {
        shared.close(reason);
    }
    tracing::trace!(conn_id = shared.id, "Reader task exiting");
}

enum WriterExit {
    Stopped,
    /// Stopped while a batch was half written; the stream is unusable.
    Abandoned,
    Failed(TransportError),
}

async fn write_loop<W>(shared: Arc<Shared>, mut writer: FramedWrite<W, FrameCodec>)
where
    W: AsyncWrite + Unpin,
{
    let drain_timeout = shared.config.drain_timeout;

    let exit = loop {
        tokio::select! {
            biased;

            _ = shared.stop.cancelled() => break WriterExit::Stopped,
            _ = shared.wake.notified() => {}
        }

        let batch = shared.take_pending();
        if batch.is_empty() {
            continue;
        }

        let written = {
            let write = write_batch(&mut writer, batch);
            tokio::pin!(write);
            tokio::select! {
                result = &mut write => Some(result),
                _ = shared.stop.cancelled() => {
                    tokio::time::timeout(drain_timeout, &mut write).await.ok()
                }
            }
        };

        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => break WriterExit::Failed(e),
            None => break WriterExit::Abandoned,
        }
    };

    match exit {
        WriterExit::Failed(e) => {
            shared.close(CloseReason::Transport(e));
        }
        WriterExit::Abandoned => {
            tracing::debug!(conn_id = shared.id, "Drain timed out mid-write");
        }
        WriterExit::Stopped => {
            let remaining = shared.take_pending();
            let drain = async {
                match write_batch(&mut writer, remaining).await {
                    Ok(()) => writer.close().await,
                    Err(e) => Err(e),
                }
            };
            match tokio::time::timeout(drain_timeout, drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(conn_id = shared.id, error = %e, "Final drain failed")
                }
                Err(_) => tracing::debug!(conn_id = shared.id, "Final drain timed out"),
            }
        }
    }
    tracing::trace!(conn_id = shared.id, "Writer task exiting");
}

async fn write_batch<W>(
    writer: &mut FramedWrite<W, FrameCodec>,
    batch: VecDeque<Outbound>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    for outbound in batch {
        writer.feed(outbound.payload).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn start(
        config: ConnectionConfig,
    ) -> (
        Connection,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        DuplexStream,
        TaskTracker,
    ) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (observer, events) = ChannelObserver::new();
        let tasks = TaskTracker::new();
        let conn = Connection::new(7, None, config, Arc::new(observer)).start(local, &tasks);
        (conn, events, remote, tasks)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn sends_arrive_in_order_as_separate_frames() {
        let (conn, _events, remote, _tasks) = start(ConnectionConfig::default());
        let mut peer = FramedRead::new(remote, FrameCodec::new());

        for i in 0u8..50 {
            conn.send(Bytes::from(vec![i; i as usize])).unwrap();
        }

        for i in 0u8..50 {
            let frame = peer.next().await.unwrap().unwrap();
            assert_eq!(frame.len(), i as usize);
            assert!(frame.iter().all(|b| *b == i));
        }
    }

    #[tokio::test]
    async fn concurrent_senders_never_interleave_frames() {
        let (conn, _events, remote, _tasks) = start(ConnectionConfig::default());
        let mut peer = FramedRead::new(remote, FrameCodec::new());

        let mut senders = Vec::new();
        for sender in 0u8..8 {
            let conn = conn.clone();
            senders.push(tokio::spawn(async move {
                for seq in 0u8..25 {
                    let mut payload = vec![sender; 1000];
                    payload[0] = seq;
                    conn.send(Bytes::from(payload)).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for s in senders {
            s.await.unwrap();
        }

        let mut next_seq = [0u8; 8];
        for _ in 0..(8 * 25) {
            let frame = peer.next().await.unwrap().unwrap();
            assert_eq!(frame.len(), 1000);
            let sender = frame[1];
            assert!(frame[1..].iter().all(|b| *b == sender), "frame mixes senders");
            // Per-sender order survives.
            assert_eq!(frame[0], next_seq[sender as usize]);
            next_seq[sender as usize] += 1;
        }
    }

    #[tokio::test]
    async fn inbound_frames_reach_observer() {
        let (_conn, mut events, remote, _tasks) = start(ConnectionConfig::default());
        let mut peer = FramedWrite::new(remote, FrameCodec::new());
        peer.send(Bytes::from_static(b"hello")).await.unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::Message { id, payload } => {
                assert_eq!(id, 7);
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_eof_closes_exactly_once() {
        let (conn, mut events, remote, tasks) = start(ConnectionConfig::default());
        drop(remote);

        match next_event(&mut events).await {
            ConnectionEvent::Closed { reason, .. } => {
                assert!(matches!(reason, CloseReason::PeerClosed))
            }
            other => panic!("expected close, got {other:?}"),
        }

        assert!(conn.is_closed());
        assert!(!conn.close());
        assert_eq!(conn.send(Bytes::new()), Err(ConnectionError::Closed(7)));

        tasks.close();
        tokio::time::timeout(WAIT, tasks.wait()).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_a_transport_close() {
        let (_conn, mut events, mut remote, _tasks) = start(ConnectionConfig::default());
        remote.write_all(&10u32.to_le_bytes()).await.unwrap();
        remote.write_all(b"abc").await.unwrap();
        remote.shutdown().await.unwrap();

        match next_event(&mut events).await {
            ConnectionEvent::Closed { reason, .. } => assert!(matches!(
                reason,
                CloseReason::Transport(TransportError::Truncated { buffered: 7 })
            )),
            other => panic!("expected close, got {other:?}"),
        }
    }

    struct CountingObserver {
        closes: AtomicUsize,
    }

    impl ConnectionObserver for CountingObserver {
        fn on_message(&self, _id: ConnectionId, _payload: Bytes) {}

        fn on_close(&self, _id: ConnectionId, _reason: CloseReason) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn racing_closes_notify_once() {
        let observer = Arc::new(CountingObserver {
            closes: AtomicUsize::new(0),
        });
        let (local, remote) = tokio::io::duplex(64);
        let tasks = TaskTracker::new();
        let conn = Connection::new(1, None, ConnectionConfig::default(), observer.clone())
            .start(local, &tasks);

        // Writer errors, reader sees EOF and two local closes all race.
        for _ in 0..16 {
            let _ = conn.send(Bytes::from(vec![0u8; 1024]));
        }
        drop(remote);
        let a = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close() }
        });
        let b = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close() }
        });
        let _ = (a.await.unwrap(), b.await.unwrap());

        tasks.close();
        tokio::time::timeout(WAIT, tasks.wait()).await.unwrap();
        assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_close_stops_both_tasks_promptly() {
        let config = ConnectionConfig::default().with_drain_timeout(Duration::from_millis(200));
        let (conn, mut events, remote, tasks) = start(config);
        // Remote never reads, so the peer sees nothing but the task must still end.
        let _remote = remote;

        assert!(conn.close());
        match next_event(&mut events).await {
            ConnectionEvent::Closed { reason, .. } => assert!(matches!(reason, CloseReason::Local)),
            other => panic!("expected close, got {other:?}"),
        }

        tasks.close();
        tokio::time::timeout(Duration::from_secs(2), tasks.wait())
            .await
            .expect("connection tasks outlived the drain timeout");
    }

    #[tokio::test]
    async fn frames_queued_before_close_are_flushed() {
        let (conn, _events, remote, _tasks) = start(ConnectionConfig::default());
        let mut peer = FramedRead::new(remote, FrameCodec::new());

        conn.send(Bytes::from_static(b"last words")).unwrap();
        conn.close();

        assert_eq!(&peer.next().await.unwrap().unwrap()[..], b"last words");
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn overflow_disconnects_by_default() {
        let config = ConnectionConfig::default().with_max_pending(Some(2));
        let (observer, mut events) = ChannelObserver::new();
        // Not started: nothing drains the queue.
        let conn = Connection::new(3, None, config, Arc::new(observer)).handle();

        conn.send(Bytes::from_static(b"a")).unwrap();
        conn.send(Bytes::from_static(b"b")).unwrap();
        assert_eq!(conn.send(Bytes::from_static(b"c")), Err(ConnectionError::Closed(3)));
        assert!(conn.is_closed());
        match next_event(&mut events).await {
            ConnectionEvent::Closed { reason, .. } => {
                assert!(matches!(reason, CloseReason::QueueOverflow))
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_can_drop_oldest_lossy() {
        let config = ConnectionConfig::default()
            .with_max_pending(Some(2))
            .with_overflow(OverflowPolicy::DropOldest);
        let (observer, _events) = ChannelObserver::new();
        let pending = Connection::new(4, None, config, Arc::new(observer));
        let conn = pending.handle();

        for payload in [&b"a"[..], b"b", b"c"] {
            conn.send_lossy(Bytes::copy_from_slice(payload)).unwrap();
        }
        assert_eq!(conn.pending(), 2);
        assert!(!conn.is_closed());

        let (local, remote) = tokio::io::duplex(64);
        let tasks = TaskTracker::new();
        let _conn = pending.start(local, &tasks);
        let mut peer = FramedRead::new(remote, FrameCodec::new());

        // Queued before start, written once the writer wakes.
        assert_eq!(&peer.next().await.unwrap().unwrap()[..], b"b");
        assert_eq!(&peer.next().await.unwrap().unwrap()[..], b"c");

        conn.send_lossy(Bytes::from_static(b"d")).unwrap();
        assert_eq!(&peer.next().await.unwrap().unwrap()[..], b"d");
    }

    #[tokio::test]
    async fn drop_oldest_only_evicts_lossy_frames() {
        let config = ConnectionConfig::default()
            .with_max_pending(Some(2))
            .with_overflow(OverflowPolicy::DropOldest);
        let (observer, _events) = ChannelObserver::new();
        let pending = Connection::new(6, None, config, Arc::new(observer));
        let conn = pending.handle();

        conn.send(Bytes::from_static(b"init")).unwrap();
        conn.send_lossy(Bytes::from_static(b"progress")).unwrap();
        // Full: the lossy frame makes room, the reliable one stays.
        conn.send(Bytes::from_static(b"assign")).unwrap();
        // Full of reliable frames: a lossy one is discarded on arrival.
        conn.send_lossy(Bytes::from_static(b"late progress")).unwrap();
        assert_eq!(conn.pending(), 2);
        assert!(!conn.is_closed());

        let (local, remote) = tokio::io::duplex(64);
        let tasks = TaskTracker::new();
        let _conn = pending.start(local, &tasks);
        let mut peer = FramedRead::new(remote, FrameCodec::new());
        assert_eq!(&peer.next().await.unwrap().unwrap()[..], b"init");
        assert_eq!(&peer.next().await.unwrap().unwrap()[..], b"assign");
    }

    #[tokio::test]
    async fn drop_oldest_disconnects_when_only_reliable_frames_are_queued() {
        let config = ConnectionConfig::default()
            .with_max_pending(Some(1))
            .with_overflow(OverflowPolicy::DropOldest);
        let (observer, mut events) = ChannelObserver::new();
        let conn = Connection::new(8, None, config, Arc::new(observer)).handle();

        conn.send(Bytes::from_static(b"init")).unwrap();
        assert_eq!(
            conn.send(Bytes::from_static(b"assign")),
            Err(ConnectionError::Closed(8))
        );
        match next_event(&mut events).await {
            ConnectionEvent::Closed { reason, .. } => {
                assert!(matches!(reason, CloseReason::QueueOverflow))
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn oversized_send_is_rejected_without_closing() {
        let config = ConnectionConfig::default().with_max_frame_length(4);
        let (observer, _events) = ChannelObserver::new();
        let conn = Connection::new(5, None, config, Arc::new(observer)).handle();

        assert_eq!(
            conn.send(Bytes::from_static(b"too long")),
            Err(ConnectionError::TooLarge { len: 8, limit: 4 })
        );
        assert!(!conn.is_closed());
        assert_eq!(conn.pending(), 0);
    }
}
