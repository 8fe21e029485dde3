use crate::analyzer::SourceDescriptor;
use std::path::Path;

/// ProRes 422 HQ at 1920x1080, 30 fps, in bits per second
const PRORES_HQ_REFERENCE_BPS: f64 = 220_000_000.0;
const REFERENCE_PIXEL_RATE: f64 = 1920.0 * 1080.0 * 30.0;

/// Get available disk space in bytes for the given path
#[cfg(unix)]
pub fn available_space(path: &Path) -> Option<u64> {
    use nix::sys::statvfs::statvfs;
    let stat = statvfs(path).ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> Option<u64> {
    None
}

/// Check if there is enough disk space for an estimated output size
pub fn has_enough_space(path: &Path, required_bytes: u64) -> bool {
    available_space(path)
        .map(|available| available > required_bytes)
        .unwrap_or(true) // If we can't check, assume it's fine
}

/// Rough size of a ProRes 422 HQ master of `source`, scaled by pixel rate.
///
/// `None` when the duration is unknown. Missing geometry or rate falls back to 1080p30.
pub fn estimate_master_size(source: &SourceDescriptor) -> Option<u64> {
    let duration = source.duration_secs.filter(|d| *d > 0.0)?;
    let width = f64::from(source.width.unwrap_or(1920));
    let height = f64::from(source.height.unwrap_or(1080));
    let fps = source.fps().filter(|f| *f > 0.0).unwrap_or(30.0);

    let bps = PRORES_HQ_REFERENCE_BPS * ((width * height * fps) / REFERENCE_PIXEL_RATE);
    Some((bps / 8.0 * duration) as u64)
}
