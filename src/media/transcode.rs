//! Video transcoding to a portable MP4 container.
//!
//! All `std::process::Command` invocations use fixed arguments; only the
//! input and output paths vary.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempPath;
use tracing::{debug, info};

/// Extensions of containers that are transcoded before sending.
pub const TRANSCODE_EXTENSIONS: &[&str] = &["mov", "avi", "mkv"];

/// Errors from a transcode attempt.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// The transcoder binary is missing or does not run.
    #[error("transcoder not available: {0}")]
    Unavailable(String),

    /// The transcoder ran and reported failure.
    #[error("transcoder exited with {status}: {stderr}")]
    Failed {
        /// Exit status as printed by the OS.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Spawning or waiting on the process failed.
    #[error("transcoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts a video file into a portable format.
pub trait Transcoder: Send + Sync {
    /// Write a transcoded copy of `input` to `output`.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError`] when the conversion did not produce
    /// `output`.
    fn transcode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;
}

/// Whether `path` has an extension from [`TRANSCODE_EXTENSIONS`]
/// (case-insensitive).
pub fn needs_transcode(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            TRANSCODE_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
}

/// Reserve a fresh output file for a transcode of `input`.
///
/// The file is created empty under the system temp directory with a unique
/// `{stem}_converted_*.mp4` name and is deleted when the returned
/// [`TempPath`] drops. Concurrent transcodes of the same source never share
/// an output, and files next to the source are never touched.
///
/// # Errors
///
/// Returns the I/O error if the temp file cannot be created.
pub fn converted_output(input: &Path) -> std::io::Result<TempPath> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media".to_owned());
    tempfile::Builder::new()
        .prefix(&format!("{stem}_converted_"))
        .suffix(".mp4")
        .tempfile()
        .map(tempfile::NamedTempFile::into_temp_path)
}

/// [`Transcoder`] that shells out to ffmpeg (H.264 video, AAC audio).
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    /// Use the given ffmpeg binary (a bare name is looked up on `PATH`).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether `ffmpeg -version` runs successfully.
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .is_ok_and(|out| out.status.success())
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcoder for FfmpegTranscoder {
    fn transcode(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        if !self.is_available() {
            return Err(TranscodeError::Unavailable(format!(
                "{} -version failed; install ffmpeg to enable conversion",
                self.binary.display()
            )));
        }

        debug!(input = %input.display(), output = %output.display(), "running ffmpeg");
        // `output` is a file reserved by `converted_output`, so overwriting
        // it is expected.
        let out = Command::new(&self.binary)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args([
                "-c:v", "libx264", "-crf", "28", "-preset", "fast", "-c:a", "aac", "-b:a", "128k",
            ])
            .arg(output)
            .stdin(Stdio::null())
            .output()?;

        if !out.status.success() {
            return Err(TranscodeError::Failed {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            });
        }
        info!(output = %output.display(), "video converted to mp4");
        Ok(())
    }
}
