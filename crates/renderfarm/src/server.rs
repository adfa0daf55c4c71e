//! TCP front end: binds the coordinator's listener and runs one job.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordinator::{JobConfig, JobCoordinator, JobEvent, JobSummary};
use crate::transport::{ConnectionConfig, SessionRegistry};

pub const DEFAULT_PORT: u16 = 42424;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}

pub struct FarmServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

impl FarmServer {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Render farm coordinator listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve `job` until it completes or `shutdown` fires.
    ///
    /// Host events go to `events`; the sender is dropped when this returns.
    pub async fn run(
        self,
        job: JobConfig,
        events: mpsc::UnboundedSender<JobEvent>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<JobSummary> {
        let drain_timeout = self.config.connection.drain_timeout;
        let (registry, sessions) = SessionRegistry::new(self.config.connection);
        let coordinator = JobCoordinator::new(job, registry.clone(), sessions, events)?;

        let stop_accepting = shutdown.child_token();
        let acceptor = tokio::spawn({
            let registry = registry.clone();
            let stop = stop_accepting.clone();
            let listener = self.listener;
            async move { registry.serve(listener, stop).await }
        });

        let summary = coordinator.run(shutdown).await;

        stop_accepting.cancel();
        if let Err(e) = acceptor.await {
            tracing::warn!(error = %e, "Acceptor task failed");
        }
        registry.shutdown(drain_timeout).await;

        info!(
            frames_completed = summary.frames_completed,
            frames_failed = summary.frames_failed,
            frames_requeued = summary.frames_requeued,
            complete = summary.complete,
            "Job finished"
        );
        Ok(summary)
    }
}
