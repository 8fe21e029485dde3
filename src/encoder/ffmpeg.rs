use crate::encoder::progress::StageProgress;
use crate::error::{AppError, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Diagnostic lines kept for the error text of a failed stage
const DIAGNOSTIC_TAIL: usize = 200;

/// How a single transcoder run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failed { status: String, diagnostics: String },
    Canceled,
}

/// Run one transcoder invocation to completion.
///
/// `args` is passed through untouched. Diagnostic output is split on both `\r` and
/// `\n` since the transcoder rewrites its status line in place. Cancellation kills
/// the child and waits for it to exit before returning.
pub async fn run_stage(
    ffmpeg_bin: &Path,
    args: &[String],
    mut progress: StageProgress,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u8),
    mut on_line: impl FnMut(&str),
) -> Result<StageOutcome> {
    if cancel.is_cancelled() {
        return Ok(StageOutcome::Canceled);
    }

    info!("Running {} {}", ffmpeg_bin.display(), args.join(" "));

    let mut child = Command::new(ffmpeg_bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Transcode {
            status: "not started".to_string(),
            diagnostics: format!("failed to execute {}: {}", ffmpeg_bin.display(), e),
        })?;

    let Some(mut stderr) = child.stderr.take() else {
        terminate(&mut child).await;
        return Err(AppError::Transcode {
            status: "not started".to_string(),
            diagnostics: "transcoder diagnostic stream unavailable".to_string(),
        });
    };

    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    let mut handle_line = |raw: &[u8], tail: &mut VecDeque<String>| {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        debug!("ffmpeg: {}", line);
        if let Some(value) = progress.feed(line) {
            on_progress(value);
        }
        on_line(line);
        if tail.len() == DIAGNOSTIC_TAIL {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    };

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Ok(StageOutcome::Canceled);
            }
            read = stderr.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to read transcoder output: {}", e);
                break;
            }
        };

        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let rest = pending.split_off(pos + 1);
            handle_line(&pending[..pos], &mut tail);
            pending = rest;
        }
    }
    if !pending.is_empty() {
        handle_line(&pending, &mut tail);
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Ok(StageOutcome::Canceled);
        }
        status = child.wait() => status?,
    };

    if status.success() {
        return Ok(StageOutcome::Success);
    }

    let diagnostics = tail.into_iter().collect::<Vec<_>>().join("\n");
    Ok(StageOutcome::Failed {
        status: status.to_string(),
        diagnostics: diagnostics.trim().to_string(),
    })
}

async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Transcoder already gone: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap transcoder: {}", e);
    }
}

/// Grab a single frame from `source` as a JPEG cover image
pub async fn extract_cover(ffmpeg_bin: &Path, source: &Path, cover: &Path) -> Result<()> {
    let output = Command::new(ffmpeg_bin)
        .args(["-hide_banner", "-y", "-i"])
        .arg(source)
        .args(["-frames:v", "1", "-q:v", "2"])
        .arg(cover)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AppError::filesystem(cover, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        return Err(AppError::Transcode {
            status: output.status.to_string(),
            diagnostics: last.trim().to_string(),
        });
    }
    Ok(())
}
