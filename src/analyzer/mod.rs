pub mod ffprobe;
pub mod metadata;

pub use ffprobe::{parse_probe_output, probe};
pub use metadata::{ColorTags, FPS_EPSILON, SourceDescriptor};
