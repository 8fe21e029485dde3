//! Batch color-grading renderer driving ffmpeg.
//!
//! [`encoder`] turns a job's parameters into transcoder invocations, [`queue`] runs
//! them on a bounded worker pool and publishes [`queue::JobEvent`]s.

pub mod analyzer;
pub mod config;
pub mod encoder;
pub mod error;
pub mod queue;
pub mod utils;

pub use error::{AppError, Result};
