pub mod deps;
pub mod disk_space;
pub mod humanize;
pub mod logger;

pub use deps::DependencyStatus;
pub use disk_space::{available_space, estimate_master_size, has_enough_space};
pub use humanize::{format_duration, format_file_size};
pub use logger::init_logging;
