//! Shell-command renderer.
//!
//! The command template may use `{scene}`, `{frame}` and `{output}`; they are
//! substituted verbatim (quote them in the template if paths can contain
//! spaces). The command must write the image to `{output}`, which is read,
//! delivered and then removed.
//!
//! Engine output is not parsed, so progress is estimated from how long the
//! previous frame took.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use renderfarm::{FrameIndex, ProgressReporter, RenderError, Renderer};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::pattern::frame_path;

const SCENE_FILE: &str = "scene";
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub struct CommandRenderer {
    template: String,
    work_dir: PathBuf,
    output_pattern: String,
    running: DashMap<FrameIndex, CancellationToken>,
    /// Duration of the last successful render in ms; 0 until one finishes.
    last_render_ms: AtomicU64,
}

/// Unregisters a running frame however its render ends, including when the
/// worker drops the render future.
struct RunningGuard<'a> {
    running: &'a DashMap<FrameIndex, CancellationToken>,
    frame: FrameIndex,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.frame);
    }
}

impl CommandRenderer {
    pub fn new(
        template: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        output_pattern: impl Into<String>,
    ) -> Self {
        Self {
            template: template.into(),
            work_dir: work_dir.into(),
            output_pattern: output_pattern.into(),
            running: DashMap::new(),
            last_render_ms: AtomicU64::new(0),
        }
    }

    fn estimate(&self) -> Option<Duration> {
        match self.last_render_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn scene_path(&self) -> PathBuf {
        self.work_dir.join(SCENE_FILE)
    }

    pub fn output_path(&self, frame: FrameIndex) -> PathBuf {
        self.work_dir.join(frame_path(&self.output_pattern, frame))
    }

    fn expand(&self, frame: FrameIndex, output: &Path) -> String {
        self.template
            .replace("{scene}", &self.scene_path().display().to_string())
            .replace("{frame}", &frame.to_string())
            .replace("{output}", &output.display().to_string())
    }

    async fn run_command(
        &self,
        script: &str,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<(), RenderError> {
        let mut child = shell(script)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let estimate = self.estimate();
        let started = Instant::now();
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill render command");
                    }
                    return Err(RenderError::Cancelled);
                }
                _ = ticker.tick() => {
                    if let Some(estimate) = estimate {
                        progress.report(estimate.saturating_sub(started.elapsed()));
                    }
                }
                status = child.wait() => {
                    let status = status?;
                    if !status.success() {
                        return Err(RenderError::failed(format!("render command exited with {status}")));
                    }
                    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    self.last_render_ms.store(elapsed.max(1), Ordering::Relaxed);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(unix)]
fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn shell(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

#[async_trait::async_trait]
impl Renderer for CommandRenderer {
    async fn prepare(&self, scene: Bytes) -> Result<(), RenderError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let path = self.scene_path();
        tokio::fs::write(&path, &scene).await?;
        tracing::info!(path = %path.display(), bytes = scene.len(), "Scene written");
        Ok(())
    }

    async fn render(
        &self,
        frame: FrameIndex,
        progress: ProgressReporter,
    ) -> Result<Bytes, RenderError> {
        let output = self.output_path(frame);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let script = self.expand(frame, &output);
        tracing::debug!(frame, %script, "Running render command");

        let cancel = CancellationToken::new();
        self.running.insert(frame, cancel.clone());
        let guard = RunningGuard {
            running: &self.running,
            frame,
        };
        let result = self.run_command(&script, &cancel, &progress).await;
        drop(guard);
        result?;

        let image = tokio::fs::read(&output).await.map_err(|e| {
            RenderError::failed(format!("no output at {}: {e}", output.display()))
        })?;
        if let Err(e) = tokio::fs::remove_file(&output).await {
            tracing::debug!(path = %output.display(), error = %e, "Could not remove output");
        }
        Ok(Bytes::from(image))
    }

    fn cancel(&self, frame: FrameIndex) {
        if let Some(token) = self.running.get(&frame) {
            tracing::info!(frame, "Killing render command");
            token.cancel();
        }
    }
}
