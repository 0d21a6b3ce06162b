//! Frame grabber — one JPEG from an RTSP URL via an ffmpeg subprocess.
//!
//! The grab pulls a single frame over TCP transport and writes it to the
//! target path at the requested quality:
//!   ffmpeg -rtsp_transport tcp -i <url> -vframes 1 -q:v <scale> -y <out>
//!
//! The subprocess is bounded by a wall-clock budget; on expiry it is killed
//! and the call fails with `Timeout`. stderr is folded into the returned
//! error. The resulting file is verified to be a non-empty JPEG before the
//! call reports success.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::CameraError;

/// Default wall-clock budget for one grab.
pub const GRAB_TIMEOUT: Duration = Duration::from_secs(10);

/// Default output quality hint (percent; mapped to ffmpeg's 2–31 scale).
pub const JPEG_QUALITY: u8 = 85;

const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];

/// stderr fragments that mean the camera could not be reached at all, as
/// opposed to reached-but-undecodable.
const UNREACHABLE_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Network is unreachable",
    "Name or service not known",
    "Temporary failure in name resolution",
    "401 Unauthorized",
    "403 Forbidden",
    "404 Not Found",
];

#[derive(Debug, Clone)]
pub struct FrameGrabber {
    tool: String,
}

impl Default for FrameGrabber {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameGrabber {
    pub fn new() -> Self {
        FrameGrabber {
            tool: "ffmpeg".to_string(),
        }
    }

    /// Use a different codec binary (tests point this at a stub).
    pub fn with_tool(tool: impl Into<String>) -> Self {
        FrameGrabber { tool: tool.into() }
    }

    /// Argument vector for a single-frame grab.
    fn grab_args(url: &str, out: &Path, quality: u8) -> Vec<String> {
        let scale = quality_to_scale(quality);
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
            "-i".to_string(),
            url.to_string(),
            "-vframes".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "image2".to_string(),
            "-q:v".to_string(),
            scale.to_string(),
            "-y".to_string(),
            out.display().to_string(),
        ]
    }

    /// Argument vector for a cheap "is a stream present" probe.
    fn probe_args(url: &str) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
            "-i".to_string(),
            url.to_string(),
            "-t".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ]
    }

    /// Pull one frame from `url` into `out`. Returns the file size in bytes.
    pub async fn grab(
        &self,
        url: &str,
        out: &Path,
        timeout: Duration,
        quality: u8,
    ) -> std::result::Result<u64, CameraError> {
        let args = Self::grab_args(url, out, quality);
        debug!(tool = %self.tool, url, "Spawning frame grab");
        let output = self.run(&args, timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_stderr(&stderr));
        }

        // The tool exited cleanly; make sure it actually produced a JPEG.
        let meta = tokio::fs::metadata(out)
            .await
            .map_err(|e| CameraError::DecodeFailed(format!("no output file: {e}")))?;
        if meta.len() == 0 {
            let _ = tokio::fs::remove_file(out).await;
            return Err(CameraError::DecodeFailed("empty output file".to_string()));
        }

        let mut magic = [0u8; 2];
        let mut file = tokio::fs::File::open(out)
            .await
            .map_err(|e| CameraError::DecodeFailed(format!("cannot reopen output: {e}")))?;
        file.read_exact(&mut magic)
            .await
            .map_err(|e| CameraError::DecodeFailed(format!("cannot read output: {e}")))?;
        if magic != JPEG_MAGIC {
            let _ = tokio::fs::remove_file(out).await;
            return Err(CameraError::DecodeFailed(
                "output is not a JPEG".to_string(),
            ));
        }

        Ok(meta.len())
    }

    /// Bounded reachability probe used by the health monitor.
    pub async fn probe(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<(), CameraError> {
        let args = Self::probe_args(url);
        let output = self.run(&args, timeout).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_stderr(&stderr))
        }
    }

    async fn run(
        &self,
        args: &[String],
        timeout: Duration,
    ) -> std::result::Result<std::process::Output, CameraError> {
        let child = Command::new(&self.tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CameraError::ToolMissing(self.tool.clone())
                } else {
                    CameraError::DecodeFailed(format!("spawn failed: {e}"))
                }
            })?;

        // Dropping the wait future on timeout drops the child, and
        // kill_on_drop takes the subprocess down with it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CameraError::DecodeFailed(format!("subprocess wait: {e}"))),
            Err(_) => Err(CameraError::Timeout(timeout)),
        }
    }
}

/// Map a 0–100 quality hint onto ffmpeg's inverted 2–31 `-q:v` scale.
fn quality_to_scale(quality: u8) -> u32 {
    (31 * (100 - quality.min(100) as u32)) / 100 + 2
}

fn classify_stderr(stderr: &str) -> CameraError {
    let summary = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no frame produced")
        .trim()
        .chars()
        .take(200)
        .collect::<String>();

    if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        CameraError::Unreachable(summary)
    } else {
        CameraError::DecodeFailed(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_args_pull_one_frame_over_tcp() {
        let args = FrameGrabber::grab_args(
            "rtsp://cam.example/stream",
            Path::new("/tmp/r1_1700000000.jpg"),
            85,
        );

        assert!(args.contains(&"-rtsp_transport".to_string()));
        assert!(args.contains(&"tcp".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"rtsp://cam.example/stream".to_string()));
        assert!(args.contains(&"-vframes".to_string()));
        assert!(args.contains(&"1".to_string()));
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/r1_1700000000.jpg"));
    }

    #[test]
    fn quality_maps_onto_ffmpeg_scale() {
        // High quality → low -q:v value.
        assert!(quality_to_scale(95) <= 5);
        // Low quality → high -q:v value.
        assert!(quality_to_scale(10) >= 25);
        // Out-of-range input is clamped rather than wrapping.
        assert_eq!(quality_to_scale(150), quality_to_scale(100));

        let args = FrameGrabber::grab_args("rtsp://c/s", Path::new("/tmp/x.jpg"), 85);
        let pos = args.iter().position(|a| a == "-q:v").expect("-q:v present");
        let value: u32 = args[pos + 1].parse().expect("numeric scale");
        assert!((2..=31).contains(&value));
    }

    #[test]
    fn probe_args_discard_output() {
        let args = FrameGrabber::probe_args("rtsp://cam.example/stream");
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"null".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn stderr_classification_splits_unreachable_from_decode() {
        let err = classify_stderr("rtsp://x: Connection refused\n");
        assert!(matches!(err, CameraError::Unreachable(_)));

        let err = classify_stderr("Output file does not contain any stream\n");
        assert!(matches!(err, CameraError::DecodeFailed(_)));

        let err = classify_stderr("");
        assert!(matches!(err, CameraError::DecodeFailed(_)));
    }
}
