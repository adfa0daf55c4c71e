//! Writes delivered frames to disk and records them in `manifest.json`.

use std::path::{Path, PathBuf};

use renderfarm::{ConnectionId, FrameIndex, JobEvent, JobSummary, RENDERFARM_VERSION};
use serde::Serialize;
use tokio::sync::mpsc;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub frame: FrameIndex,
    pub worker: ConnectionId,
    /// Relative to the output directory.
    pub path: String,
    pub bytes: usize,
}

#[derive(Serialize)]
struct Manifest<'a> {
    renderfarm: &'a str,
    summary: &'a JobSummary,
    frames: &'a [FrameRecord],
}

pub struct FrameSink {
    dir: PathBuf,
    pattern: String,
    records: Vec<FrameRecord>,
}

impl FrameSink {
    pub async fn create(dir: impl Into<PathBuf>, pattern: impl Into<String>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            pattern: pattern.into(),
            records: Vec::new(),
        })
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Consume job events until the coordinator drops its sender.
    pub async fn consume(mut self, mut events: mpsc::UnboundedReceiver<JobEvent>) -> Self {
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::FrameCompleted {
                    frame,
                    worker,
                    image,
                } => {
                    let relative = crate::pattern::frame_path(&self.pattern, frame);
                    match write_frame(&self.dir.join(&relative), &image).await {
                        Ok(()) => {
                            tracing::debug!(frame, path = %relative, "Frame written");
                            self.records.push(FrameRecord {
                                frame,
                                worker,
                                path: relative,
                                bytes: image.len(),
                            });
                        }
                        Err(e) => {
                            tracing::error!(frame, path = %relative, error = %e, "Failed to write frame")
                        }
                    }
                }
                JobEvent::FrameProgress {
                    frame, remaining, ..
                } => {
                    tracing::info!(frame, remaining_secs = remaining.as_secs(), "Rendering");
                }
                JobEvent::JobCompleted => {
                    tracing::info!(frames = self.records.len(), "Job complete");
                }
                _ => {}
            }
        }
        self
    }

    pub async fn write_manifest(&mut self, summary: &JobSummary) -> anyhow::Result<PathBuf> {
        self.records.sort_by_key(|r| r.frame);
        let manifest = Manifest {
            renderfarm: RENDERFARM_VERSION,
            summary,
            frames: &self.records,
        };
        let path = self.dir.join(MANIFEST_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&manifest)?).await?;
        Ok(path)
    }
}

async fn write_frame(path: &Path, image: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, image).await
}
