//! Worker agent: the process that connects out to a coordinator.
//!
//! State machine:
//! - AwaitingInit: nothing rendered until the scene arrives
//! - Idle ⇄ Rendering: assigned frames queue locally and render one at a time
//!
//! Rendering itself is delegated to a [`Renderer`]. Scene preparation and
//! each render run on their own tasks and report back over completion
//! channels, so the event loop keeps reading (and can act on `Cancel` or
//! shutdown) while either is in flight.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::protocol::{FrameIndex, Message, ProtocolError};
use crate::transport::{ChannelObserver, CloseReason, Connection, ConnectionConfig, ConnectionEvent};

/// Reported for an `Assign` that arrives before the scene.
pub const NOT_INITIALISED: &str = "scene not initialised";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render failed: {message}")]
    Failed { message: String },

    #[error("render cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RenderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// The rendering backend a worker drives.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Store the scene so later renders can use it.
    async fn prepare(&self, scene: Bytes) -> Result<(), RenderError>;

    /// Render one frame and return the encoded image.
    async fn render(
        &self,
        frame: FrameIndex,
        progress: ProgressReporter,
    ) -> Result<Bytes, RenderError>;

    /// Ask an in-flight render to stop. May return before it has.
    ///
    /// The worker also drops the render future once it cancels a frame, so
    /// a render that has not noticed this call yet still ends.
    fn cancel(&self, frame: FrameIndex);
}

/// Sends `Progress` for one frame back to the coordinator.
#[derive(Clone)]
pub struct ProgressReporter {
    frame: FrameIndex,
    connection: Connection,
}

impl ProgressReporter {
    pub fn new(frame: FrameIndex, connection: Connection) -> Self {
        Self { frame, connection }
    }

    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    /// Best effort: under a full `DropOldest` queue the report may be dropped.
    pub fn report(&self, remaining: Duration) {
        let message = Message::Progress {
            frame: self.frame,
            remaining,
        };
        if let Err(e) = self.connection.send_lossy(message.encode()) {
            tracing::trace!(frame = self.frame, error = %e, "Progress not sent");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub connection: ConnectionConfig,
}

impl WorkerConfig {
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub frames_delivered: u64,
    pub frames_failed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("scene preparation failed: {0}")]
    Prepare(#[source] RenderError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection lost: {0}")]
    Disconnected(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingInit,
    Idle,
    Rendering(FrameIndex),
}

/// Connect to a coordinator over TCP and work until it hangs up.
pub async fn connect<R: Renderer>(
    addr: String,
    renderer: Arc<R>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<WorkerSummary, WorkerError> {
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| WorkerError::Connect {
            addr: addr.clone(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let peer = stream.peer_addr().ok();
    tracing::info!(coordinator = %addr, "Connected to coordinator");

    run_worker(stream, peer, renderer, config, shutdown).await
}

/// Run the worker protocol over an already-open stream.
///
/// Returns when the coordinator closes the stream or `shutdown` fires.
pub async fn run_worker<S, R>(
    stream: S,
    peer: Option<SocketAddr>,
    renderer: Arc<R>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> Result<WorkerSummary, WorkerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    R: Renderer,
{
    let drain_timeout = config.connection.drain_timeout;
    let (observer, mut inbound) = ChannelObserver::new();
    let tasks = TaskTracker::new();
    let connection =
        Connection::new(0, peer, config.connection, Arc::new(observer)).start(stream, &tasks);

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let (prepared_tx, mut prepared_rx) = mpsc::unbounded_channel();
    let mut agent = Agent {
        state: WorkerState::AwaitingInit,
        queue: VecDeque::new(),
        renderer,
        connection: connection.clone(),
        done_tx,
        prepared_tx,
        preparing: None,
        scene_generation: 0,
        current: None,
        summary: WorkerSummary::default(),
    };

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Worker shutdown requested");
                break Ok(());
            }

            Some((frame, outcome)) = done_rx.recv() => agent.finish(frame, outcome),

            Some((generation, prepared)) = prepared_rx.recv() => {
                if let Err(e) = agent.prepared(generation, prepared) {
                    break Err(e);
                }
            }

            event = inbound.recv() => match event {
                Some(ConnectionEvent::Message { payload, .. }) => {
                    if let Err(e) = agent.handle(payload) {
                        break Err(e);
                    }
                }
                Some(ConnectionEvent::Closed { reason, .. }) => break match reason {
                    CloseReason::PeerClosed | CloseReason::Local => Ok(()),
                    other => Err(WorkerError::Disconnected(other)),
                },
                None => break Ok(()),
            },
        }
    };

    agent.abort_current();
    if let Err(WorkerError::Protocol(e)) = &result {
        connection.close_with(CloseReason::Protocol(e.clone()));
    } else {
        connection.close();
    }
    tasks.close();
    if tokio::time::timeout(drain_timeout, tasks.wait())
        .await
        .is_err()
    {
        tracing::debug!("Connection tasks outlived the drain timeout");
    }

    let summary = agent.summary;
    tracing::info!(
        frames_delivered = summary.frames_delivered,
        frames_failed = summary.frames_failed,
        "Worker stopped"
    );
    result.map(|()| summary)
}

struct Agent<R: Renderer> {
    state: WorkerState,
    queue: VecDeque<FrameIndex>,
    renderer: Arc<R>,
    connection: Connection,
    done_tx: mpsc::UnboundedSender<(FrameIndex, Result<Bytes, RenderError>)>,
    prepared_tx: mpsc::UnboundedSender<(u64, Result<(), RenderError>)>,
    /// Scene being written; renders wait until it is done.
    preparing: Option<JoinHandle<()>>,
    /// Bumped per `Init` so a superseded preparation is ignored.
    scene_generation: u64,
    /// Cancels the in-flight render task.
    current: Option<CancellationToken>,
    summary: WorkerSummary,
}

impl<R: Renderer> Agent<R> {
    fn handle(&mut self, payload: Bytes) -> Result<(), WorkerError> {
        match Message::decode(payload)? {
            Message::Init { scene } => {
                if self.state != WorkerState::AwaitingInit {
                    tracing::warn!("Scene sent twice, preparing again");
                }
                tracing::info!(bytes = scene.len(), "Scene received");
                if self.state == WorkerState::AwaitingInit {
                    self.state = WorkerState::Idle;
                }
                self.prepare(scene);
            }
            Message::Assign { frame } => {
                if self.state == WorkerState::AwaitingInit {
                    tracing::warn!(frame, "Assignment before scene, refusing");
                    self.report_failure(frame, NOT_INITIALISED.to_string());
                    return Ok(());
                }
                tracing::debug!(frame, queued = self.queue.len(), "Frame assigned");
                self.queue.push_back(frame);
                self.start_next();
            }
            Message::Cancel { frames, reason } => {
                tracing::warn!(?frames, %reason, "Coordinator cancelled frames");
                let mut dropped = Vec::new();
                self.queue.retain(|queued| {
                    let cancelled = frames.contains(queued);
                    if cancelled {
                        dropped.push(*queued);
                    }
                    !cancelled
                });
                for frame in dropped {
                    self.report_failure(frame, format!("cancelled: {reason}"));
                }
                if let WorkerState::Rendering(current) = self.state
                    && frames.contains(&current)
                {
                    self.cancel_current(current);
                }
            }
            other => return Err(other.unexpected().into()),
        }
        Ok(())
    }

    fn prepare(&mut self, scene: Bytes) {
        // The newest scene wins.
        if let Some(previous) = self.preparing.take() {
            previous.abort();
        }
        self.scene_generation += 1;
        let generation = self.scene_generation;
        let renderer = Arc::clone(&self.renderer);
        let prepared = self.prepared_tx.clone();
        self.preparing = Some(tokio::spawn(async move {
            let result = renderer.prepare(scene).await;
            let _ = prepared.send((generation, result));
        }));
    }

    fn prepared(
        &mut self,
        generation: u64,
        result: Result<(), RenderError>,
    ) -> Result<(), WorkerError> {
        if generation != self.scene_generation {
            return Ok(());
        }
        self.preparing = None;
        result.map_err(WorkerError::Prepare)?;
        tracing::debug!("Scene ready");
        self.start_next();
        Ok(())
    }

    fn start_next(&mut self) {
        if self.state != WorkerState::Idle || self.preparing.is_some() {
            return;
        }
        let Some(frame) = self.queue.pop_front() else {
            return;
        };

        self.state = WorkerState::Rendering(frame);
        tracing::info!(frame, "Rendering frame");

        let renderer = Arc::clone(&self.renderer);
        let progress = ProgressReporter::new(frame, self.connection.clone());
        let done = self.done_tx.clone();
        let cancel = CancellationToken::new();
        self.current = Some(cancel.clone());
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => Err(RenderError::Cancelled),
                outcome = renderer.render(frame, progress) => outcome,
            };
            let _ = done.send((frame, outcome));
        });
    }

    fn finish(&mut self, frame: FrameIndex, outcome: Result<Bytes, RenderError>) {
        self.state = WorkerState::Idle;
        self.current = None;
        match outcome {
            Ok(image) => {
                tracing::info!(frame, bytes = image.len(), "Frame rendered");
                match self.connection.send(Message::Deliver { frame, image }.encode()) {
                    Ok(()) => {
                        self.summary.frames_delivered = self.summary.frames_delivered.saturating_add(1)
                    }
                    Err(e) => tracing::warn!(frame, error = %e, "Delivery not sent"),
                }
            }
            Err(e) => {
                tracing::warn!(frame, error = %e, "Render failed");
                self.report_failure(frame, e.to_string());
            }
        }
        self.start_next();
    }

    fn report_failure(&mut self, frame: FrameIndex, reason: String) {
        match self.connection.send(Message::Failure { frame, reason }.encode()) {
            Ok(()) => self.summary.frames_failed = self.summary.frames_failed.saturating_add(1),
            Err(e) => tracing::warn!(frame, error = %e, "Failure report not sent"),
        }
    }

    fn cancel_current(&self, frame: FrameIndex) {
        self.renderer.cancel(frame);
        if let Some(cancel) = &self.current {
            cancel.cancel();
        }
    }

    fn abort_current(&mut self) {
        if let Some(preparing) = self.preparing.take() {
            tracing::debug!("Abandoning scene preparation");
            preparing.abort();
        }
        if let WorkerState::Rendering(frame) = self.state {
            tracing::debug!(frame, "Abandoning in-flight render");
            self.cancel_current(frame);
        }
    }
}
