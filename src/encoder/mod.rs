pub mod command_builder;
pub mod ffmpeg;
pub mod params;
pub mod pipeline;
pub mod progress;

pub use command_builder::build_command;
pub use ffmpeg::{StageOutcome, extract_cover, run_stage};
pub use params::{
    BitDepthPolicy, LutInputMatrix, LutInterpolation, LutOutputTags, ProcessingMode,
    ProcessingParams,
};
pub use pipeline::{CommandStage, build_pipeline};
pub use progress::StageProgress;
