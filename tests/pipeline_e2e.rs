#![cfg(unix)]

use lut_renderer::encoder::{ProcessingMode, ProcessingParams};
use lut_renderer::queue::{Job, JobEvent, JobId, JobStatus, QueueManager, Toolchain};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(20);

const PROBE_JSON: &str = r#"{"streams":[{"width":1920,"height":1080,"pix_fmt":"yuv420p","avg_frame_rate":"30/1","r_frame_rate":"30/1","duration":"2.000000","color_range":"tv","color_space":"bt709","color_transfer":"bt709","color_primaries":"bt709"}],"format":{"duration":"2.000000","bit_rate":"8000000"}}"#;

/// Writes the output file and reports two progress ticks
const SUCCEED: &str = r#"printf 'frame=30 time=00:00:01.00 bitrate=1\r' >&2
echo data > "$out"
echo "frame=60 time=00:00:02.00 bitrate=1" >&2
exit 0"#;

const FAIL: &str = r#"echo "[h264 @ 0x1] Error while decoding stream #0:0: Invalid data found" >&2
exit 1"#;

/// Master stage writes a partial file and then hangs until killed
const HANG_IN_MASTER: &str = r#"case "$out" in
  *_master.mov) echo partial > "$out"; exec sleep 30;;
esac
echo data > "$out"
exit 0"#;

const HANG: &str = r#"echo partial > "$out"
exec sleep 30"#;

const SLOW: &str = r#"sleep 0.3
echo data > "$out"
exit 0"#;

#[derive(Clone, Copy)]
enum Prober {
    Works,
    Broken,
    Hangs,
}

struct Fixture {
    dir: TempDir,
    calls: PathBuf,
    probes: PathBuf,
    tools: Toolchain,
}

impl Fixture {
    fn new(ffmpeg_body: &str) -> Self {
        Self::with_prober(ffmpeg_body, Prober::Works)
    }

    fn with_prober(ffmpeg_body: &str, prober: Prober) -> Self {
        let dir = TempDir::new().unwrap();
        let calls = dir.path().join("ffmpeg_calls.log");
        let probes = dir.path().join("ffprobe_calls.log");

        let ffmpeg = dir.path().join("ffmpeg");
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\nout=\"$last\"\necho \"$*\" >> '{}'\n\
             echo \"  Duration: 00:00:02.00, start: 0.000000, bitrate: 8000 kb/s\" >&2\n{}\n",
            calls.display(),
            ffmpeg_body
        );
        write_script(&ffmpeg, &script);

        let ffprobe = dir.path().join("ffprobe");
        let probe_body = match prober {
            Prober::Works => format!("cat <<'JSON'\n{}\nJSON\nexit 0", PROBE_JSON),
            Prober::Broken => "echo 'moov atom not found' >&2\nexit 1".to_string(),
            Prober::Hangs => "exec sleep 30".to_string(),
        };
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\necho \"$last\" >> '{}'\n{}\n",
            probes.display(),
            probe_body
        );
        write_script(&ffprobe, &script);

        let source = dir.path().join("clip.mov");
        std::fs::write(&source, b"source").unwrap();
        std::fs::write(dir.path().join("look.cube"), b"LUT_3D_SIZE 2\n").unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();

        Self {
            tools: Toolchain { ffmpeg, ffprobe },
            dir,
            calls,
            probes,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn job(&self, params: ProcessingParams) -> Job {
        self.job_named("clip", params)
    }

    fn job_named(&self, name: &str, params: ProcessingParams) -> Job {
        Job::new(
            self.path("clip.mov"),
            self.path(&format!("out/{name}_out.mp4")),
            params,
        )
    }

    fn manager(&self, concurrency: usize) -> QueueManager {
        QueueManager::new(self.tools.clone(), concurrency).unwrap()
    }

    fn ffmpeg_calls(&self) -> Vec<String> {
        read_lines(&self.calls)
    }

    fn ffprobe_calls(&self) -> Vec<String> {
        read_lines(&self.probes)
    }
}

fn write_script(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_idle(manager: &QueueManager) {
    timeout(WAIT, manager.wait_idle())
        .await
        .expect("queue did not drain in time");
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn pro_params() -> ProcessingParams {
    ProcessingParams {
        processing_mode: ProcessingMode::Pro,
        video_codec: "libx264".into(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_job_completes_with_rate_control() {
    let fx = Fixture::new(SUCCEED);
    let manager = fx.manager(1);
    let mut rx = manager.subscribe();

    let params = ProcessingParams {
        bitrate: Some("4000k".into()),
        ..Default::default()
    };
    let id = manager.submit(fx.job(params)).unwrap();
    wait_idle(&manager).await;

    let job = manager.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.error.is_empty());
    assert!(job.started_at.is_some() && job.finished_at.is_some());
    assert!(job.destination.exists());

    let calls = fx.ffmpeg_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("-b:v 4000k -maxrate 4000k -bufsize 8000k"));
    assert!(calls[0].contains("-fps_mode passthrough"));
    assert_eq!(fx.ffprobe_calls().len(), 1);

    let events = drain(&mut rx);
    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));
    assert!(events.contains(&JobEvent::Added { id }));
    assert!(events.iter().any(|e| matches!(e, JobEvent::Log { line, .. } if line.contains("Rate control"))));
    assert!(events.contains(&JobEvent::QueueDrained));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pro_job_bakes_master_then_removes_it() {
    let fx = Fixture::new(SUCCEED);
    let manager = fx.manager(1);
    let master = fx.path("cache/clip_master.mov");

    let job = fx
        .job(pro_params())
        .with_lut(fx.path("look.cube"))
        .with_intermediate(&master);
    let id = manager.submit(job).unwrap();
    wait_idle(&manager).await;

    let job = manager.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{}", job.error);
    assert!(job.destination.exists());
    assert!(!master.exists(), "master should be cleaned up");

    let calls = fx.ffmpeg_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("-c:v prores_ks"));
    assert!(calls[0].contains("-pix_fmt yuv422p10le"));
    assert!(calls[0].contains("lut3d=file="));
    assert!(calls[0].contains("-color_primaries bt709 -color_trc bt709 -colorspace bt709 -color_range tv"));
    assert!(calls[0].ends_with("clip_master.mov"));

    assert!(!calls[1].contains("lut3d"));
    assert!(calls[1].contains(&format!("-i {}", master.display())));
    assert!(calls[1].contains("-c:v libx264"));

    // source first, then the master before the distribution stage
    let probes = fx.ffprobe_calls();
    assert_eq!(probes.len(), 2);
    assert!(probes[1].ends_with("clip_master.mov"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_stage_keeps_diagnostics() {
    let fx = Fixture::new(FAIL);
    let manager = fx.manager(1);

    let id = manager.submit(fx.job(ProcessingParams::default())).unwrap();
    wait_idle(&manager).await;

    let job = manager.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.contains("Invalid data found"), "{}", job.error);
    assert!(!job.destination.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_distribution_keeps_master() {
    let fx = Fixture::new(
        r#"case "$out" in
  *_master.mov) echo data > "$out"; exit 0;;
esac
echo "Unknown encoder" >&2
exit 1"#,
    );
    let manager = fx.manager(1);
    let master = fx.path("cache/clip_master.mov");

    let id = manager
        .submit(fx.job(pro_params()).with_intermediate(&master))
        .unwrap();
    wait_idle(&manager).await;

    let job = manager.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.contains("Unknown encoder"));
    assert!(master.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_master_stops_the_pipeline() {
    let fx = Fixture::new(HANG_IN_MASTER);
    let manager = fx.manager(1);
    let master = fx.path("cache/clip_master.mov");

    let id = manager
        .submit(
            fx.job(pro_params())
                .with_lut(fx.path("look.cube"))
                .with_intermediate(&master),
        )
        .unwrap();

    wait_for(|| master.exists()).await;
    assert_eq!(manager.get(id).unwrap().status, JobStatus::Running);

    manager.cancel(id).unwrap();
    wait_idle(&manager).await;

    let job = manager.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(!job.error.is_empty());
    assert!(!master.exists(), "partial master should be removed");
    assert!(!job.destination.exists());
    assert_eq!(fx.ffmpeg_calls().len(), 1, "distribution must never start");

    // already finished: no-op
    manager.cancel(id).unwrap();
    assert_eq!(manager.get(id).unwrap().status, JobStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_right_after_submit_does_not_hang() {
    let fx = Fixture::new(HANG);
    let manager = fx.manager(1);

    let id = manager.submit(fx.job(ProcessingParams::default())).unwrap();
    manager.cancel(id).unwrap();
    wait_idle(&manager).await;

    assert_eq!(manager.get(id).unwrap().status, JobStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_while_probing_does_not_wait_for_the_prober() {
    let fx = Fixture::with_prober(SUCCEED, Prober::Hangs);
    let manager = fx.manager(1);

    let id = manager.submit(fx.job(ProcessingParams::default())).unwrap();
    wait_for(|| !fx.ffprobe_calls().is_empty()).await;
    manager.cancel(id).unwrap();

    timeout(Duration::from_secs(5), manager.wait_idle())
        .await
        .expect("cancel waited for the prober");
    let job = manager.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(fx.ffmpeg_calls().is_empty(), "no stage may start");
    assert!(!job.destination.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_removes_an_overwritten_destination() {
    let fx = Fixture::new(HANG);
    let manager = fx.manager(1);
    let job = fx.job(ProcessingParams::default());
    let destination = job.destination.clone();
    std::fs::write(&destination, "previous render\n").unwrap();

    let id = manager.submit(job).unwrap();
    wait_for(|| {
        std::fs::read_to_string(&destination).is_ok_and(|c| c.starts_with("partial"))
    })
    .await;
    manager.cancel(id).unwrap();
    wait_idle(&manager).await;

    assert_eq!(manager.get(id).unwrap().status, JobStatus::Canceled);
    assert!(!destination.exists(), "truncated output must not be left behind");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failure_keeps_a_destination_ffmpeg_was_told_not_to_touch() {
    let fx = Fixture::new(FAIL);
    let manager = fx.manager(1);
    let params = ProcessingParams {
        overwrite: false,
        ..Default::default()
    };
    let job = fx.job(params);
    let destination = job.destination.clone();
    std::fs::write(&destination, "previous render\n").unwrap();

    let id = manager.submit(job).unwrap();
    wait_idle(&manager).await;

    assert_eq!(manager.get(id).unwrap().status, JobStatus::Failed);
    assert!(fx.ffmpeg_calls()[0].contains(" -n "));
    assert_eq!(
        std::fs::read_to_string(&destination).unwrap(),
        "previous render\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_job_is_canceled_without_running() {
    let fx = Fixture::new(HANG);
    let manager = fx.manager(1);

    let first = manager
        .submit(fx.job_named("first", ProcessingParams::default()))
        .unwrap();
    let second = manager
        .submit(fx.job_named("second", ProcessingParams::default()))
        .unwrap();
    assert_eq!(manager.get(second).unwrap().status, JobStatus::Pending);

    manager.cancel(second).unwrap();
    assert_eq!(manager.get(second).unwrap().status, JobStatus::Canceled);

    manager.cancel(first).unwrap();
    wait_idle(&manager).await;
    assert_eq!(manager.get(first).unwrap().status, JobStatus::Canceled);
    assert!(fx.ffmpeg_calls().len() <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_bound_is_respected() {
    let fx = Fixture::new(SLOW);
    let manager = fx.manager(2);
    let mut rx = manager.subscribe();

    let ids: Vec<JobId> = (0..5)
        .map(|i| manager.add(fx.job_named(&format!("j{i}"), ProcessingParams::default())))
        .collect();
    assert_eq!(manager.start_all(), 5);
    wait_idle(&manager).await;

    let mut running = 0i32;
    let mut peak = 0i32;
    for event in drain(&mut rx) {
        if let JobEvent::StatusChanged { status, .. } = event {
            match status {
                JobStatus::Running => running += 1,
                s if s.is_terminal() => running -= 1,
                _ => {}
            }
            peak = peak.max(running);
        }
    }
    assert!(peak <= 2, "peak concurrency {peak}");
    assert!(peak >= 1);
    for id in ids {
        assert_eq!(manager.get(id).unwrap().status, JobStatus::Completed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_failure_is_not_fatal() {
    let fx = Fixture::with_prober(SUCCEED, Prober::Broken);
    let manager = fx.manager(1);

    let id = manager.submit(fx.job(ProcessingParams::default())).unwrap();
    wait_idle(&manager).await;

    assert_eq!(manager.get(id).unwrap().status, JobStatus::Completed);
    // unknown source with force_cfr falls back to plain cfr
    assert!(fx.ffmpeg_calls()[0].contains("-fps_mode cfr"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_runs_a_finished_job_again() {
    let fx = Fixture::new(FAIL);
    let manager = fx.manager(1);

    let id = manager.submit(fx.job(ProcessingParams::default())).unwrap();
    wait_idle(&manager).await;
    assert_eq!(manager.get(id).unwrap().status, JobStatus::Failed);

    assert!(manager.submit(manager.get(id).unwrap()).is_err());

    manager.retry(id).unwrap();
    wait_idle(&manager).await;
    assert_eq!(manager.get(id).unwrap().status, JobStatus::Failed);
    assert_eq!(fx.ffmpeg_calls().len(), 2);

    assert_eq!(manager.clear_finished(), 1);
    assert!(manager.get(id).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cover_is_written_after_completion() {
    let fx = Fixture::new(SUCCEED);
    let manager = fx.manager(1);
    let cover = fx.path("out/clip_cover.jpg");

    let id = manager
        .submit(fx.job(ProcessingParams::default()).with_cover(&cover))
        .unwrap();
    wait_idle(&manager).await;

    assert_eq!(manager.get(id).unwrap().status, JobStatus::Completed);
    assert!(cover.exists());
    assert!(fx.ffmpeg_calls()[1].contains("-frames:v 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_concurrency_lets_waiting_jobs_start() {
    let fx = Fixture::new(SLOW);
    let manager = fx.manager(1);
    let ids: Vec<JobId> = (0..3)
        .map(|i| manager.add(fx.job_named(&format!("c{i}"), ProcessingParams::default())))
        .collect();
    manager.start_all();
    manager.set_concurrency(3);
    assert_eq!(manager.concurrency(), 3);
    wait_idle(&manager).await;

    for id in ids {
        assert_eq!(manager.get(id).unwrap().status, JobStatus::Completed);
    }
}
