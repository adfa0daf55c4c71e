//! Job coordinator: a single actor owning one job's frame schedule.
//!
//! All session events funnel through one channel, so the schedule needs no
//! locks. Handlers never await: sends only queue onto a connection.
//!
//! Flow:
//! 1. Worker connects → `Init` with the scene, then `Assign` up to the pipeline depth
//! 2. `Deliver` → frame done, the same worker is topped up
//! 3. `Failure` or disconnect → frames go to the retry queue, idle workers are topped up
//! 4. Fresh counter exhausted, retry queue empty, nothing held → job complete

pub mod schedule;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{FrameIndex, Message};
use crate::transport::{CloseReason, ConnectionId, SessionEvent, SessionRegistry};

pub use schedule::{FrameSchedule, ScheduleError};

/// Reason attached to the `Cancel` sent when the coordinator stops early.
pub const SHUTDOWN_REASON: &str = "coordinator shutting down";

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Opaque scene payload sent to every worker in `Init`.
    pub scene: Bytes,
    pub start_frame: FrameIndex,
    pub frame_count: u32,
    /// Frames a worker may hold at once.
    pub pipeline_depth: usize,
    /// Stop once every frame is delivered instead of idling for more workers.
    pub stop_when_complete: bool,
}

impl JobConfig {
    pub fn new(scene: impl Into<Bytes>, start_frame: FrameIndex, frame_count: u32) -> Self {
        Self {
            scene: scene.into(),
            start_frame,
            frame_count,
            pipeline_depth: 1,
            stop_when_complete: true,
        }
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_stop_when_complete(mut self, stop: bool) -> Self {
        self.stop_when_complete = stop;
        self
    }
}

/// What the coordinator reports to its host.
#[derive(Debug, Clone)]
pub enum JobEvent {
    ClientConnected {
        id: ConnectionId,
        peer: Option<SocketAddr>,
    },
    ClientDisconnected {
        id: ConnectionId,
        requeued: Vec<FrameIndex>,
    },
    FrameAssigned {
        frame: FrameIndex,
        worker: ConnectionId,
    },
    FrameCompleted {
        frame: FrameIndex,
        worker: ConnectionId,
        image: Bytes,
    },
    FrameFailed {
        frame: FrameIndex,
        worker: ConnectionId,
        reason: String,
    },
    FrameProgress {
        frame: FrameIndex,
        worker: ConnectionId,
        remaining: Duration,
    },
    JobCompleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub frames_completed: u32,
    pub frames_failed: u64,
    pub frames_requeued: u64,
    pub complete: bool,
}

pub struct JobCoordinator {
    schedule: FrameSchedule,
    registry: SessionRegistry,
    sessions: mpsc::UnboundedReceiver<SessionEvent>,
    host: mpsc::UnboundedSender<JobEvent>,
    init_payload: Bytes,
    pipeline_depth: usize,
    stop_when_complete: bool,
    announced: bool,
}

impl JobCoordinator {
    pub fn new(
        job: JobConfig,
        registry: SessionRegistry,
        sessions: mpsc::UnboundedReceiver<SessionEvent>,
        host: mpsc::UnboundedSender<JobEvent>,
    ) -> Result<Self, ScheduleError> {
        let schedule = FrameSchedule::new(job.start_frame, job.frame_count)?;
        // Encoded once; every worker gets the same bytes.
        let init_payload = Message::Init { scene: job.scene }.encode();
        Ok(Self {
            schedule,
            registry,
            sessions,
            host,
            init_payload,
            pipeline_depth: job.pipeline_depth.max(1),
            stop_when_complete: job.stop_when_complete,
            announced: false,
        })
    }

    /// Process session events until the job completes (when configured to
    /// stop), `shutdown` fires, or the registry goes away.
    pub async fn run(mut self, shutdown: CancellationToken) -> JobSummary {
        if self.check_complete() && self.stop_when_complete {
            return self.summary();
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Coordinator shutdown requested");
                    self.cancel_in_flight(SHUTDOWN_REASON);
                    break;
                }

                event = self.sessions.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Session channel closed");
                        break;
                    };
                    self.handle(event);
                    if self.check_complete() && self.stop_when_complete {
                        break;
                    }
                }
            }
        }

        self.summary()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            frames_completed: self.schedule.completed(),
            frames_failed: self.schedule.failed(),
            frames_requeued: self.schedule.requeued(),
            complete: self.schedule.is_complete(),
        }
    }

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ClientConnected { id, peer } => self.on_client_connect(id, peer),
            SessionEvent::ClientDisconnected { id, reason } => {
                self.on_client_disconnect(id, reason)
            }
            SessionEvent::MessageReceived { id, payload } => self.on_message(id, payload),
        }
    }

    fn on_client_connect(&mut self, id: ConnectionId, peer: Option<SocketAddr>) {
        // A connection can close between registration and this event; its
        // disconnect has then already been handled (or dropped as unknown).
        if !self.registry.contains(id) {
            tracing::debug!(conn_id = id, "Connection gone before it was adopted");
            return;
        }

        self.schedule.add_worker(id);
        tracing::info!(conn_id = id, ?peer, "Worker joined");
        self.emit(JobEvent::ClientConnected { id, peer });

        if let Err(e) = self.registry.send_to(id, self.init_payload.clone()) {
            tracing::warn!(conn_id = id, error = %e, "Failed to send scene");
            return;
        }
        self.top_up(id);
    }

    fn on_client_disconnect(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some(requeued) = self.schedule.remove_worker(id) else {
            tracing::debug!(conn_id = id, %reason, "Unadopted connection closed");
            return;
        };
        tracing::info!(conn_id = id, %reason, ?requeued, "Worker left");
        let any_requeued = !requeued.is_empty();
        self.emit(JobEvent::ClientDisconnected { id, requeued });

        if any_requeued {
            self.dispatch_idle();
        }
    }

    fn on_message(&mut self, id: ConnectionId, payload: Bytes) {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(conn_id = id, error = %e, "Malformed message from worker");
                self.registry.disconnect(id, CloseReason::Protocol(e));
                return;
            }
        };

        match message {
            Message::Deliver { frame, image } => match self.schedule.complete(id, frame) {
                Ok(()) => {
                    tracing::info!(conn_id = id, frame, bytes = image.len(), "Frame delivered");
                    self.emit(JobEvent::FrameCompleted {
                        frame,
                        worker: id,
                        image,
                    });
                    self.top_up(id);
                }
                Err(e) => tracing::warn!(conn_id = id, frame, error = %e, "Ignoring delivery"),
            },
            Message::Failure { frame, reason } => match self.schedule.fail(id, frame) {
                Ok(()) => {
                    tracing::warn!(conn_id = id, frame, %reason, "Frame failed, requeued");
                    self.emit(JobEvent::FrameFailed {
                        frame,
                        worker: id,
                        reason,
                    });
                    self.dispatch_idle();
                }
                Err(e) => tracing::warn!(conn_id = id, frame, error = %e, "Ignoring failure report"),
            },
            Message::Progress { frame, remaining } => {
                tracing::debug!(conn_id = id, frame, ?remaining, "Frame progress");
                self.emit(JobEvent::FrameProgress {
                    frame,
                    worker: id,
                    remaining,
                });
            }
            other @ (Message::Init { .. } | Message::Assign { .. } | Message::Cancel { .. }) => {
                let e = other.unexpected();
                tracing::warn!(conn_id = id, error = %e, "Worker sent a coordinator message");
                self.registry.disconnect(id, CloseReason::Protocol(e));
            }
        }
    }

    /// Assign until the worker holds `pipeline_depth` frames or nothing is left.
    fn top_up(&mut self, id: ConnectionId) {
        while self.schedule.held(id) < self.pipeline_depth {
            let Some(frame) = self.schedule.assign_next(id) else {
                break;
            };
            tracing::debug!(conn_id = id, frame, "Assigning frame");
            self.emit(JobEvent::FrameAssigned { frame, worker: id });

            if let Err(e) = self.registry.send_to(id, Message::Assign { frame }.encode()) {
                // The frame stays in the worker's set and is requeued when
                // the disconnect event arrives.
                tracing::warn!(conn_id = id, frame, error = %e, "Assignment not delivered");
                break;
            }
        }
    }

    /// Top up every worker with spare capacity, lowest id first.
    fn dispatch_idle(&mut self) {
        let hungry: Vec<ConnectionId> = self
            .schedule
            .workers()
            .filter(|id| self.schedule.held(*id) < self.pipeline_depth)
            .collect();
        for id in hungry {
            if !self.schedule.has_unassigned() {
                break;
            }
            self.top_up(id);
        }
    }

    fn cancel_in_flight(&mut self, reason: &str) {
        let workers: Vec<ConnectionId> = self.schedule.workers().collect();
        for id in workers {
            let frames = self.schedule.assigned_to(id);
            if frames.is_empty() {
                continue;
            }
            tracing::info!(conn_id = id, ?frames, "Cancelling in-flight frames");
            let cancel = Message::Cancel {
                frames,
                reason: reason.to_string(),
            };
            if let Err(e) = self.registry.send_to(id, cancel.encode()) {
                tracing::debug!(conn_id = id, error = %e, "Cancel not delivered");
            }
        }
    }

    /// Returns whether the job is complete, announcing it the first time.
    fn check_complete(&mut self) -> bool {
        let complete = self.schedule.is_complete();
        if complete && !self.announced {
            self.announced = true;
            tracing::info!(
                frames_completed = self.schedule.completed(),
                frames_failed = self.schedule.failed(),
                "All frames delivered"
            );
            self.emit(JobEvent::JobCompleted);
        }
        complete
    }

    fn emit(&self, event: JobEvent) {
        // The host may stop listening; the job carries on regardless.
        let _ = self.host.send(event);
    }
}
