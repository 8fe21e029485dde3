use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lut_renderer::analyzer::{self, SourceDescriptor};
use lut_renderer::config::{AppConfig, PresetStore};
use lut_renderer::encoder::{ProcessingMode, ProcessingParams, build_command, build_pipeline};
use lut_renderer::queue::{
    Job, JobEvent, JobId, JobStatus, QueueManager, cover_path_for, default_output_dir,
    intermediate_path_for, is_video_file, output_path_for,
};
use lut_renderer::utils::{self, DependencyStatus, format_duration, format_file_size};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "lut-renderer", version, about = "Batch LUT grading and delivery encodes with ffmpeg")]
struct Cli {
    /// Config file (defaults to the per-user config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render files or directories
    Run {
        #[command(flatten)]
        job: JobArgs,
        /// Jobs running at the same time
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
        /// Skip the ffmpeg/ffprobe availability check
        #[arg(long)]
        skip_checks: bool,
    },
    /// Print what ffmpeg reports about a file
    Probe { file: PathBuf },
    /// Print the planned transcoder commands without running them
    Command {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Manage saved parameter presets
    Presets {
        #[command(subcommand)]
        action: PresetAction,
    },
}

#[derive(Args)]
struct JobArgs {
    /// Source files or directories
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// 3D LUT to apply (.cube)
    #[arg(long)]
    lut: Option<PathBuf>,
    /// Start from a saved preset instead of the configured defaults
    #[arg(long)]
    preset: Option<String>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Parameter override, e.g. `--set bitrate=8M` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Where pro-mode masters are written
    #[arg(long)]
    intermediate_dir: Option<PathBuf>,
    /// Fill unset resolution and bitrate from each source
    #[arg(long)]
    match_source: bool,
    /// Save a JPEG cover next to each output
    #[arg(long)]
    cover: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Fast,
    Pro,
}

#[derive(Subcommand)]
enum PresetAction {
    List,
    Show {
        name: String,
    },
    /// Save the configured defaults plus overrides under a name
    Save {
        name: String,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        /// Replace an existing preset
        #[arg(long)]
        force: bool,
    },
    Rename {
        old: String,
        new: String,
    },
    Delete {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let guard = utils::init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::load(),
    };

    match cli.command {
        Command::Run {
            job,
            jobs,
            skip_checks,
        } => {
            let ok = run(&config, &job, jobs, skip_checks).await?;
            if !ok {
                drop(guard);
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Probe { file } => {
            let descriptor = analyzer::probe(&config.ffprobe_bin, &file)
                .await
                .with_context(|| format!("Failed to probe {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            println!(
                "variable frame rate: {}",
                if descriptor.is_variable_frame_rate() { "yes" } else { "no" }
            );
            Ok(())
        }
        Command::Command { job } => print_plan(&config, &job).await,
        Command::Presets { action } => presets(&config, action),
    }
}

fn parse_overrides(raw: &[String]) -> Result<Vec<(&str, &str)>> {
    raw.iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .with_context(|| format!("Override '{}' is not KEY=VALUE", item))
        })
        .collect()
}

fn base_params(config: &AppConfig, args: &JobArgs) -> Result<ProcessingParams> {
    let mut params = match &args.preset {
        Some(name) => PresetStore::default_location()
            .load(name)
            .with_context(|| format!("Failed to load preset '{}'", name))?,
        None => config.defaults.clone(),
    };
    if let Some(mode) = args.mode {
        params.processing_mode = match mode {
            ModeArg::Fast => ProcessingMode::Fast,
            ModeArg::Pro => ProcessingMode::Pro,
        };
    }
    Ok(params.with_overrides(parse_overrides(&args.overrides)?)?)
}

/// Expand directories into the video files below them
fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_video_file(e.path()))
                .map(|e| e.into_path())
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    files
}

/// Build one job per source, probing each on the way
async fn build_jobs(config: &AppConfig, args: &JobArgs) -> Result<Vec<Job>> {
    let params = base_params(config, args)?;
    let sources = collect_inputs(&args.inputs);
    if sources.is_empty() {
        bail!("No video files found");
    }
    if let Some(lut) = &args.lut
        && !lut.is_file()
    {
        bail!("LUT not found: {}", lut.display());
    }

    let intermediate_dir = args
        .intermediate_dir
        .clone()
        .or_else(|| config.intermediate_dir.clone());
    if params.processing_mode == ProcessingMode::Pro && intermediate_dir.is_none() {
        bail!("Pro mode needs an intermediate directory (--intermediate-dir or intermediate_dir in config)");
    }

    let mut jobs = Vec::new();
    let mut reserved = HashSet::new();
    for source in sources {
        if !source.is_file() {
            bail!("Source not found: {}", source.display());
        }

        let descriptor = match analyzer::probe(&config.ffprobe_bin, &source).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("{}: {}; using default inference", source.display(), e);
                None
            }
        };

        let mut job_params = params.clone();
        if args.match_source
            && let Some(d) = &descriptor
        {
            for applied in job_params.fill_from_source(d) {
                info!("{}: matched source {}", source.display(), applied);
            }
        }

        let output_dir = args
            .output_dir
            .clone()
            .or_else(|| config.output_dir.clone())
            .unwrap_or_else(|| default_output_dir(&source));
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let destination = output_path_for(&source, &output_dir, &mut reserved);
        let wants_cover = args.cover || job_params.generate_cover;
        let mut job = Job::new(&source, destination, job_params);
        if let Some(d) = descriptor {
            job = job.with_descriptor(d);
        }
        if let Some(lut) = &args.lut {
            job = job.with_lut(lut);
        }
        if wants_cover {
            job = job.with_cover(cover_path_for(&source, &output_dir, &mut reserved));
        }
        if job.params.processing_mode == ProcessingMode::Pro
            && let Some(dir) = &intermediate_dir
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            job = job.with_intermediate(intermediate_path_for(&source, dir, &mut reserved));
        }
        jobs.push(job);
    }
    Ok(jobs)
}

/// Warn when masters will probably not fit
fn check_master_space(jobs: &[Job]) {
    let mut per_dir: HashMap<PathBuf, u64> = HashMap::new();
    for job in jobs {
        let (Some(path), Some(d)) = (&job.intermediate, &job.descriptor) else {
            continue;
        };
        let Some(size) = utils::estimate_master_size(d) else {
            continue;
        };
        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        *per_dir.entry(dir).or_default() += size;
    }
    for (dir, required) in per_dir {
        if !utils::has_enough_space(&dir, required) {
            let available = utils::available_space(&dir).unwrap_or(0);
            warn!(
                "Masters need about {} in {} but only {} is free",
                format_file_size(required),
                dir.display(),
                format_file_size(available)
            );
        }
    }
}

async fn run(
    config: &AppConfig,
    args: &JobArgs,
    jobs_override: Option<usize>,
    skip_checks: bool,
) -> Result<bool> {
    if !skip_checks {
        let deps = DependencyStatus::check(&config.ffmpeg_bin, &config.ffprobe_bin).await;
        let missing = deps.missing(args.lut.is_some());
        if !missing.is_empty() {
            bail!("Missing dependencies: {}", missing.join(", "));
        }
    }

    let jobs = build_jobs(config, args).await?;
    check_master_space(&jobs);

    let concurrency = jobs_override.unwrap_or(config.max_concurrency);
    let manager = QueueManager::new(config.toolchain(), concurrency)?;
    let mut events = manager.subscribe();

    let mut names: HashMap<JobId, String> = HashMap::new();
    for job in jobs {
        names.insert(job.id, job.filename());
        manager.add(job);
    }

    let ctrl_c = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling all jobs");
            ctrl_c.cancel_all();
        }
    });

    let started = Instant::now();
    let scheduled = manager.start_all();
    info!("Rendering {} file(s), {} at a time", scheduled, manager.concurrency());

    let mut last_shown: HashMap<JobId, u8> = HashMap::new();
    while !manager.is_idle() {
        match events.recv().await {
            Ok(event) => print_event(&event, &names, &mut last_shown),
            Err(RecvError::Lagged(n)) => debug!("Skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }

    let counts = manager.counts();
    println!(
        "Done in {}: {} completed, {} failed, {} canceled",
        format_duration(started.elapsed()),
        counts.completed,
        counts.failed,
        counts.canceled
    );
    for job in manager.snapshot() {
        if job.status == JobStatus::Failed {
            println!("  {}: {}", job.filename(), job.error);
        }
    }
    Ok(counts.failed == 0 && counts.canceled == 0)
}

fn print_event(event: &JobEvent, names: &HashMap<JobId, String>, last_shown: &mut HashMap<JobId, u8>) {
    let Some(id) = event.job_id() else {
        return;
    };
    let name = names.get(&id).cloned().unwrap_or_else(|| id.to_string());
    match event {
        JobEvent::Progress { progress, .. } => {
            let shown = last_shown.entry(id).or_insert(0);
            if *progress >= shown.saturating_add(10) || *progress == 100 {
                *shown = *progress;
                println!("{:>3}%  {}", progress, name);
            }
        }
        JobEvent::StatusChanged { status, error, .. } => match error {
            Some(error) if *status == JobStatus::Failed => {
                println!("{}: {} ({})", name, status, error.lines().last().unwrap_or(""))
            }
            _ => println!("{}: {}", name, status),
        },
        JobEvent::Log { line, .. } => debug!("{}: {}", name, line),
        JobEvent::Added { .. } | JobEvent::QueueDrained => {}
    }
}

async fn print_plan(config: &AppConfig, args: &JobArgs) -> Result<()> {
    for job in build_jobs(config, args).await? {
        println!("# {}", job.source.display());
        for stage in build_pipeline(&job)? {
            let descriptor: Option<SourceDescriptor> = if stage.probe_source {
                None
            } else {
                job.descriptor.clone()
            };
            let mut notes = stage.notes.clone();
            let args = build_command(
                &stage.source,
                &stage.output,
                &stage.params,
                stage.lut_path.as_deref(),
                descriptor.as_ref(),
                &mut notes,
            );
            println!("## {}", stage.name);
            println!("{} {}", config.ffmpeg_bin.display(), shell_join(&args));
            if stage.probe_source {
                println!("  - input is probed again before this stage runs");
            }
            if stage.cleanup_on_success {
                println!("  - {} is deleted once this stage succeeds", stage.source.display());
            }
            for note in notes {
                println!("  - {}", note);
            }
        }
        println!();
    }
    Ok(())
}

fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if !a.is_empty()
                && a.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=+,".contains(c))
            {
                a.clone()
            } else {
                format!("'{}'", a.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn presets(config: &AppConfig, action: PresetAction) -> Result<()> {
    let store = PresetStore::default_location();
    match action {
        PresetAction::List => {
            for (name, params) in store.load_all()? {
                println!(
                    "{:<20} {:<5} {}",
                    name,
                    params.processing_mode.to_string(),
                    params.video_codec
                );
            }
        }
        PresetAction::Show { name } => {
            let params = store.load(&name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::Value::Object(
                    params.to_representation()
                ))?
            );
        }
        PresetAction::Save {
            name,
            overrides,
            force,
        } => {
            let params = config
                .defaults
                .with_overrides(parse_overrides(&overrides)?)?;
            let path = if force {
                store.overwrite(&name, &params)?
            } else {
                store.save(&name, &params)?
            };
            println!("Saved {}", path.display());
        }
        PresetAction::Rename { old, new } => {
            let path = store.rename(&old, &new)?;
            println!("Renamed to {}", path.display());
        }
        PresetAction::Delete { name } => {
            store.delete(&name)?;
            println!("Deleted {}", name);
        }
    }
    Ok(())
}
