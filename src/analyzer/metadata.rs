use serde::Serialize;

/// Largest gap between average and reported frame rate still treated as constant
pub const FPS_EPSILON: f64 = 0.1;

/// Color signalling tags as reported by the prober
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColorTags {
    pub primaries: Option<String>,
    pub transfer: Option<String>,
    pub matrix: Option<String>,
    pub range: Option<String>,
}

impl ColorTags {
    pub fn is_empty(&self) -> bool {
        self.primaries.is_none()
            && self.transfer.is_none()
            && self.matrix.is_none()
            && self.range.is_none()
    }
}

/// Snapshot of a source file's primary video stream
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceDescriptor {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Nominal bitrate in bits per second
    pub bitrate: Option<u64>,
    pub avg_fps: Option<f64>,
    pub r_fps: Option<f64>,
    pub duration_secs: Option<f64>,
    pub pixel_format: Option<String>,
    pub bit_depth: Option<u32>,
    pub color: ColorTags,
}

impl SourceDescriptor {
    /// Derived on every call so it can never go stale after a field changes.
    pub fn is_variable_frame_rate(&self) -> bool {
        match (self.avg_fps, self.r_fps) {
            (Some(avg), Some(r)) => (avg - r).abs() > FPS_EPSILON,
            _ => false,
        }
    }

    /// Best known frame rate: average first, then the reported rate
    pub fn fps(&self) -> Option<f64> {
        self.avg_fps.or(self.r_fps)
    }

    pub fn resolution_string(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }

    /// Bitrate in the transcoder's `<n>k` notation
    pub fn bitrate_string(&self) -> Option<String> {
        self.bitrate
            .filter(|b| *b > 0)
            .map(|b| format!("{}k", ((b as f64 / 1000.0).round() as u64).max(1)))
    }

    /// True for legacy `yuvj*` formats or an explicit PC range tag
    pub fn is_full_range(&self) -> bool {
        self.pixel_format
            .as_deref()
            .is_some_and(|p| p.starts_with("yuvj"))
            || self
                .color
                .range
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case("pc"))
    }

    pub fn is_high_bit_depth(&self) -> bool {
        self.bit_depth.is_some_and(|d| d >= 10)
    }
}
