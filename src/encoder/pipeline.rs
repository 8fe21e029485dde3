use crate::encoder::params::{BitDepthPolicy, ProcessingMode, ProcessingParams};
use crate::error::{AppError, Result};
use crate::queue::Job;
use std::path::PathBuf;

pub const MASTER_CODEC: &str = "prores_ks";
/// prores_ks profile 3 is 422 HQ
pub const MASTER_PROFILE: &str = "3";
pub const MASTER_PIX_FMT: &str = "yuv422p10le";

/// One transcoder invocation within a job
#[derive(Debug, Clone)]
pub struct CommandStage {
    pub name: String,
    pub source: PathBuf,
    pub output: PathBuf,
    pub params: ProcessingParams,
    pub lut_path: Option<PathBuf>,
    /// Delete this stage's input once this stage has succeeded
    pub cleanup_on_success: bool,
    pub notes: Vec<String>,
    /// Input differs from the original source and must be probed again
    pub probe_source: bool,
}

/// Plan the stages for a job without touching the filesystem.
pub fn build_pipeline(job: &Job) -> Result<Vec<CommandStage>> {
    match job.params.processing_mode {
        ProcessingMode::Fast => Ok(vec![CommandStage {
            name: "fast".to_string(),
            source: job.source.clone(),
            output: job.destination.clone(),
            params: job.params.clone(),
            lut_path: job.lut.clone(),
            cleanup_on_success: false,
            notes: Vec::new(),
            probe_source: false,
        }]),
        ProcessingMode::Pro => {
            let intermediate = job.intermediate.clone().ok_or_else(|| {
                AppError::InvalidParameterCombination(
                    "pro mode requires an intermediate (master) path".to_string(),
                )
            })?;
            if intermediate == job.source || intermediate == job.destination {
                return Err(AppError::InvalidParameterCombination(format!(
                    "intermediate path {} collides with the job's source or destination",
                    intermediate.display()
                )));
            }

            Ok(vec![
                CommandStage {
                    name: "master".to_string(),
                    source: job.source.clone(),
                    output: intermediate.clone(),
                    params: master_params(&job.params),
                    lut_path: job.lut.clone(),
                    cleanup_on_success: false,
                    notes: vec![format!(
                        "Master: ProRes 422 HQ ({}), audio copied",
                        MASTER_PIX_FMT
                    )],
                    probe_source: false,
                },
                CommandStage {
                    name: "distribution".to_string(),
                    source: intermediate,
                    output: job.destination.clone(),
                    params: job.params.clone(),
                    lut_path: None,
                    cleanup_on_success: true,
                    notes: Vec::new(),
                    probe_source: true,
                },
            ])
        }
    }
}

/// Distribution params turned into a lossless-ish mezzanine encode
pub fn master_params(params: &ProcessingParams) -> ProcessingParams {
    ProcessingParams {
        video_codec: MASTER_CODEC.to_string(),
        audio_codec: "copy".to_string(),
        pix_fmt: Some(MASTER_PIX_FMT.to_string()),
        profile: Some(MASTER_PROFILE.to_string()),
        level: None,
        crf: None,
        preset: None,
        tune: None,
        bitrate: None,
        audio_bitrate: None,
        sample_rate: None,
        channels: None,
        faststart: false,
        bit_depth_policy: BitDepthPolicy::Preserve,
        ..params.clone()
    }
}
