use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// What the external toolchain can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyStatus {
    pub ffmpeg: bool,
    pub ffprobe: bool,
    /// Transcoder was built with the `lut3d` filter
    pub lut3d: bool,
}

impl DependencyStatus {
    /// Check all dependencies
    pub async fn check(ffmpeg: &Path, ffprobe: &Path) -> Self {
        let ffmpeg_ok = check_command(ffmpeg, &["-version"]).await;
        Self {
            ffmpeg: ffmpeg_ok,
            ffprobe: check_command(ffprobe, &["-version"]).await,
            lut3d: ffmpeg_ok && has_filter(ffmpeg, "lut3d").await,
        }
    }

    /// Human-readable list of what is missing for the requested work
    pub fn missing(&self, needs_lut: bool) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.ffmpeg {
            missing.push("ffmpeg");
        }
        if !self.ffprobe {
            missing.push("ffprobe");
        }
        if needs_lut && self.ffmpeg && !self.lut3d {
            missing.push("ffmpeg lut3d filter");
        }
        missing
    }
}

/// Check if a command is available
async fn check_command(cmd: &Path, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

/// Check if a filter is compiled into FFmpeg
async fn has_filter(ffmpeg: &Path, filter: &str) -> bool {
    Command::new(ffmpeg)
        .args(["-hide_banner", "-filters"])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()
        .map(|o| {
            String::from_utf8_lossy(&o.stdout)
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(filter))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_only_reports_what_is_needed() {
        let status = DependencyStatus {
            ffmpeg: true,
            ffprobe: true,
            lut3d: false,
        };
        assert!(status.missing(false).is_empty());
        assert_eq!(status.missing(true), vec!["ffmpeg lut3d filter"]);
    }

    #[tokio::test]
    async fn absent_binary_is_reported() {
        let status = DependencyStatus::check(
            Path::new("/nonexistent/ffmpeg"),
            Path::new("/nonexistent/ffprobe"),
        )
        .await;
        assert_eq!(status.missing(true), vec!["ffmpeg", "ffprobe"]);
    }
}
