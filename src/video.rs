use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::runtime::Runtime;
use tokio::time::Instant;

use crate::sampling::FramePlan;

pub const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "webm", "avi", "mov", "mkv"];
pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMeta {
    pub video_id: String,
    pub duration_secs: f64,
    pub native_fps: f64,
}

impl VideoMeta {
    pub fn effective_fps(&self) -> f64 {
        if self.native_fps.is_finite() && self.native_fps > 0.0 {
            self.native_fps
        } else {
            DEFAULT_FPS
        }
    }

    pub fn frame_count(&self) -> u64 {
        let frames = (self.duration_secs * self.effective_fps()).floor();
        if frames.is_finite() && frames >= 1.0 {
            frames as u64
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFrame {
    pub frame_index: u64,
    pub timestamp_secs: f64,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("video file not found: {0}")]
    NotFound(String),

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        program: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout_ms}ms")]
    TimedOut {
        program: &'static str,
        timeout_ms: u64,
    },

    #[error("failed to parse ffprobe output: {0}")]
    Probe(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reads metadata and frames out of a video container.
pub trait FrameSource: Send + Sync {
    fn probe(&self, video_id: &str, path: &Path) -> Result<VideoMeta, VideoError>;

    fn extract_frames(
        &self,
        path: &Path,
        plan: &FramePlan,
    ) -> Result<Vec<ExtractedFrame>, VideoError>;
}

pub fn resolve_video_path(video_dir: &Path, video_id: &str) -> Option<PathBuf> {
    VIDEO_EXTENSIONS
        .iter()
        .map(|ext| video_dir.join(format!("{video_id}.{ext}")))
        .find(|path| path.is_file())
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// `FrameSource` backed by the `ffprobe` and `ffmpeg` binaries. Every video gets one
/// deadline shared by all of its subprocesses.
#[derive(Debug, Clone)]
pub struct FfmpegFrameSource {
    timeout: Duration,
    frame_width: u32,
}

impl FfmpegFrameSource {
    pub fn new(timeout: Duration, frame_width: u32) -> Self {
        Self {
            timeout,
            frame_width,
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn probe(&self, video_id: &str, path: &Path) -> Result<VideoMeta, VideoError> {
        if !path.exists() {
            return Err(VideoError::NotFound(path.display().to_string()));
        }

        let mut command = Command::new("ffprobe");
        command
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-select_streams",
                "v:0",
            ])
            .arg(path);

        let deadline = Instant::now() + self.timeout;
        let stdout = current_thread_runtime()?.block_on(run_until(
            command,
            "ffprobe",
            deadline,
            self.timeout,
        ))?;
        let raw = String::from_utf8_lossy(&stdout);
        let probe = serde_json::from_str::<FfprobeOutput>(&raw)
            .map_err(|err| VideoError::Probe(format!("{err}: {}", raw.trim())))?;

        let stream = probe
            .streams
            .iter()
            .find(|stream| stream.codec_type.as_deref() == Some("video"));

        let duration_secs = probe
            .format
            .as_ref()
            .and_then(|format| format.duration.as_deref())
            .or_else(|| stream.and_then(|stream| stream.duration.as_deref()))
            .and_then(|value| value.trim().parse::<f64>().ok())
            .ok_or_else(|| VideoError::Probe(format!("no duration for {}", path.display())))?;

        let native_fps = stream
            .and_then(|stream| {
                stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
            })
            .unwrap_or(DEFAULT_FPS);

        Ok(VideoMeta {
            video_id: video_id.to_string(),
            duration_secs,
            native_fps,
        })
    }

    fn extract_frames(
        &self,
        path: &Path,
        plan: &FramePlan,
    ) -> Result<Vec<ExtractedFrame>, VideoError> {
        if !path.exists() {
            return Err(VideoError::NotFound(path.display().to_string()));
        }

        let deadline = Instant::now() + self.timeout;
        let scale = format!("scale={}:-2", self.frame_width);

        current_thread_runtime()?.block_on(async {
            let mut frames = Vec::with_capacity(plan.len());
            for (frame_index, timestamp_secs) in plan.indices.iter().zip(plan.timestamps.iter()) {
                let mut command = Command::new("ffmpeg");
                command
                    .args(["-v", "error", "-ss", &format!("{timestamp_secs:.3}"), "-i"])
                    .arg(path)
                    .args([
                        "-frames:v",
                        "1",
                        "-vf",
                        &scale,
                        "-q:v",
                        "3",
                        "-f",
                        "image2pipe",
                        "-vcodec",
                        "mjpeg",
                        "-",
                    ]);

                let jpeg = run_until(command, "ffmpeg", deadline, self.timeout).await?;
                if jpeg.is_empty() {
                    // Seeking past the last decodable frame yields nothing; the plan stays aligned.
                    continue;
                }
                frames.push(ExtractedFrame {
                    frame_index: *frame_index,
                    timestamp_secs: *timestamp_secs,
                    jpeg,
                });
            }
            Ok::<_, VideoError>(frames)
        })
    }
}

/// Parses ffprobe rates such as `"30/1"`, `"24000/1001"` or `"25"`.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    let rate = match trimmed.split_once('/') {
        Some((numerator, denominator)) => {
            let numerator = numerator.trim().parse::<f64>().ok()?;
            let denominator = denominator.trim().parse::<f64>().ok()?;
            if denominator == 0.0 {
                return None;
            }
            numerator / denominator
        }
        None => trimmed.parse::<f64>().ok()?,
    };

    (rate.is_finite() && rate > 0.0).then_some(rate)
}

fn current_thread_runtime() -> Result<Runtime, VideoError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(VideoError::Io)
}

/// Runs `command` to completion, failing once `deadline` passes. A timed-out child is
/// killed when its future is dropped.
async fn run_until(
    mut command: Command,
    program: &'static str,
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<u8>, VideoError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|source| VideoError::Spawn { program, source })?;

    let output = match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(VideoError::TimedOut {
                program,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
    };

    if !output.status.success() {
        return Err(VideoError::ExecutionFailed {
            program,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

pub fn tool_version(program: &str) -> Option<String> {
    let output = std::process::Command::new(program)
        .arg("-version")
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);

    stdout
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
}
