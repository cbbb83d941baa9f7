//! Screen observation capture.
//!
//! Verification needs a picture of what the action produced. Capture is
//! read-only by default: the verifier never asks for the target window to be
//! activated, so taking a screenshot does not change the state being judged.
//!
//! Requires: scrot or ImageMagick `import`; `convert` for downscaling.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture unavailable: {0}")]
    Unavailable(String),

    #[error("{program} failed: {message}")]
    CommandFailed { program: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One captured image plus the hash used as its identity.
#[derive(Debug, Clone)]
pub struct Observation {
    pub id: Uuid,
    pub mime_type: String,
    pub bytes: Arc<[u8]>,
    /// Hex SHA-256 of `bytes`
    pub hash: String,
    pub target: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Observation {
    pub fn from_bytes(mime_type: impl Into<String>, bytes: Vec<u8>, target: Option<String>) -> Self {
        let hash = hex::encode(Sha256::digest(&bytes));
        Self {
            id: Uuid::new_v4(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
            hash,
            target,
            captured_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Inline `data:` URL for multimodal chat messages.
    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Source of observations for visual verification.
#[async_trait]
pub trait ObservationCapture: Send + Sync {
    /// Whether a capture can be attempted at all in this environment.
    fn is_available(&self) -> bool;

    /// Capture the screen, optionally focused on `target`.
    ///
    /// With `activate = false` the capture must not change focus or window
    /// stacking.
    async fn capture(
        &self,
        target: Option<&str>,
        activate: bool,
    ) -> Result<Observation, CaptureError>;
}

/// Capture used when no display is configured.
pub struct NoCapture;

#[async_trait]
impl ObservationCapture for NoCapture {
    fn is_available(&self) -> bool {
        false
    }

    async fn capture(&self, _: Option<&str>, _: bool) -> Result<Observation, CaptureError> {
        Err(CaptureError::Unavailable("no display configured".to_string()))
    }
}

/// X11 screenshot capture via scrot, falling back to ImageMagick `import`.
pub struct ScreenshotCapture {
    display: String,
    scratch_dir: PathBuf,
    max_bytes: usize,
    timeout: Duration,
}

impl ScreenshotCapture {
    pub fn new(display: impl Into<String>, scratch_dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            display: display.into(),
            scratch_dir: scratch_dir.into(),
            max_bytes,
            timeout: Duration::from_secs(30),
        }
    }

    /// Run a command with DISPLAY set, returning stderr on failure.
    async fn run_with_display(&self, program: &str, args: &[&str]) -> Result<(), CaptureError> {
        let output = match tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .env("DISPLAY", &self.display)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CaptureError::CommandFailed {
                    program: program.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(CaptureError::CommandFailed {
                    program: program.to_string(),
                    message: "timed out".to_string(),
                })
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(CaptureError::CommandFailed {
                program: program.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn grab(&self, path: &Path) -> Result<(), CaptureError> {
        let path_str = path.to_string_lossy();
        match self.run_with_display("scrot", &["-o", &path_str]).await {
            Ok(()) => Ok(()),
            Err(scrot_err) => {
                tracing::debug!(error = %scrot_err, "scrot failed, trying import");
                self.run_with_display("import", &["-window", "root", &path_str])
                    .await
                    .map_err(|import_err| CaptureError::CommandFailed {
                        program: "screenshot".to_string(),
                        message: format!("scrot: {}; import: {}", scrot_err, import_err),
                    })
            }
        }
    }

    /// Halve the image until it fits the byte budget (at most three passes).
    async fn shrink(&self, path: &Path, mut bytes: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
        let path_str = path.to_string_lossy();
        for _ in 0..3 {
            if bytes.len() <= self.max_bytes {
                break;
            }
            self.run_with_display("convert", &[&path_str, "-resize", "50%", &path_str])
                .await?;
            bytes = tokio::fs::read(path).await?;
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ObservationCapture for ScreenshotCapture {
    fn is_available(&self) -> bool {
        !self.display.is_empty()
    }

    async fn capture(
        &self,
        target: Option<&str>,
        activate: bool,
    ) -> Result<Observation, CaptureError> {
        if !self.is_available() {
            return Err(CaptureError::Unavailable("no display configured".to_string()));
        }

        if activate {
            if let Some(name) = target {
                self.run_with_display("xdotool", &["search", "--name", name, "windowactivate"])
                    .await?;
            }
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        // Removed on drop, whichever step fails
        let scratch = tempfile::Builder::new()
            .prefix("observation-")
            .suffix(".png")
            .tempfile_in(&self.scratch_dir)?;

        self.grab(scratch.path()).await?;
        let bytes = tokio::fs::read(scratch.path()).await?;
        let bytes = self.shrink(scratch.path(), bytes).await?;

        tracing::debug!(
            display = %self.display,
            size_bytes = bytes.len(),
            target = ?target,
            "Captured observation"
        );

        Ok(Observation::from_bytes(
            "image/png",
            bytes,
            target.map(str::to_string),
        ))
    }
}
