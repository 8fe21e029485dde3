use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap());
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap());

/// Turns transcoder diagnostic lines into overall job progress.
///
/// Stage `index` of `count` owns the range `[100*index/count, 100*(index+1)/count]`.
/// A stage that is not the last one never reports its upper bound; that value is
/// only reached through [`StageProgress::finish`] once the stage has exited cleanly.
#[derive(Debug, Clone)]
pub struct StageProgress {
    duration: Option<f64>,
    base: u8,
    end: u8,
    is_final: bool,
    last: Option<u8>,
}

impl StageProgress {
    pub fn new(index: usize, count: usize, known_duration: Option<f64>) -> Self {
        let count = count.max(1);
        let index = index.min(count - 1);
        Self {
            duration: known_duration.filter(|d| *d > 0.0),
            base: (100 * index / count) as u8,
            end: (100 * (index + 1) / count) as u8,
            is_final: index + 1 == count,
            last: None,
        }
    }

    pub fn base(&self) -> u8 {
        self.base
    }

    /// Feed one line; returns the new overall percentage when it moved forward
    pub fn feed(&mut self, line: &str) -> Option<u8> {
        if self.duration.is_none()
            && let Some(d) = parse_duration(line).filter(|d| *d > 0.0)
        {
            self.duration = Some(d);
            return None;
        }

        let elapsed = parse_time(line)?;
        let duration = self.duration?;
        let span = f64::from(self.end - self.base);
        let mut value = self.base + ((elapsed / duration).clamp(0.0, 1.0) * span) as u8;
        if !self.is_final {
            value = value.min(self.end.saturating_sub(1).max(self.base));
        }

        if self.last.is_some_and(|last| value <= last) {
            return None;
        }
        self.last = Some(value);
        Some(value)
    }

    /// Percentage once the stage exited successfully
    pub fn finish(&self) -> u8 {
        self.end
    }
}

fn to_seconds(caps: &regex::Captures<'_>) -> Option<f64> {
    let h: f64 = caps.get(1)?.as_str().parse().ok()?;
    let m: f64 = caps.get(2)?.as_str().parse().ok()?;
    let s: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

pub fn parse_duration(line: &str) -> Option<f64> {
    to_seconds(&DURATION_RE.captures(line)?)
}

pub fn parse_time(line: &str) -> Option<f64> {
    to_seconds(&TIME_RE.captures(line)?)
}
