use crate::analyzer::metadata::{ColorTags, SourceDescriptor};
use crate::error::{AppError, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

const STREAM_ENTRIES: &str = "stream=width,height,bit_rate,avg_frame_rate,r_frame_rate,pix_fmt,bits_per_raw_sample,color_primaries,color_transfer,color_space,color_range,duration";

/// Probe the primary video stream of `path` with ffprobe.
///
/// Dropping the returned future kills the prober.
pub async fn probe(ffprobe_bin: &Path, path: &Path) -> Result<SourceDescriptor> {
    debug!("Probing {}", path.display());

    let output = Command::new(ffprobe_bin)
        .args(["-v", "error", "-select_streams", "v:0", "-show_entries"])
        .arg(STREAM_ENTRIES)
        .args(["-show_entries", "format=bit_rate,duration", "-of", "json"])
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            AppError::Probe(format!(
                "failed to execute {}: {}",
                ffprobe_bin.display(),
                e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Probe(format!(
            "ffprobe failed for {}: {}",
            path.display(),
            stderr.trim()
        )));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ffprobe's JSON output into a descriptor
pub fn parse_probe_output(json: &str) -> Result<SourceDescriptor> {
    let data: FfprobeOutput = serde_json::from_str(if json.trim().is_empty() { "{}" } else { json })
        .map_err(|e| AppError::Probe(format!("failed to parse ffprobe output: {}", e)))?;

    let stream = data.streams.into_iter().next().unwrap_or_default();
    let format = data.format.unwrap_or_default();

    let pixel_format = stream.pix_fmt.filter(|p| !p.is_empty());
    let bit_depth = infer_bit_depth(
        pixel_format.as_deref(),
        stream.bits_per_raw_sample.as_deref(),
    );

    let mut range = normalize_color(stream.color_range);
    if range.is_none() && pixel_format.as_deref().is_some_and(|p| p.starts_with("yuvj")) {
        // yuvj* is yuv* with implied full range
        range = Some("pc".to_string());
    }

    let duration_secs = [stream.duration.as_deref(), format.duration.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|d| d.trim().parse::<f64>().ok());

    let bitrate = stream
        .bit_rate
        .as_deref()
        .or(format.bit_rate.as_deref())
        .and_then(|b| b.trim().parse::<f64>().ok())
        .filter(|b| *b > 0.0)
        .map(|b| b as u64);

    Ok(SourceDescriptor {
        width: stream.width,
        height: stream.height,
        bitrate,
        avg_fps: parse_fraction(stream.avg_frame_rate.as_deref()),
        r_fps: parse_fraction(stream.r_frame_rate.as_deref()),
        duration_secs,
        pixel_format,
        bit_depth,
        color: ColorTags {
            primaries: normalize_color(stream.color_primaries),
            transfer: normalize_color(stream.color_transfer),
            matrix: normalize_color(stream.color_space),
            range,
        },
    })
}

/// Parse `num/den` or a plain decimal; `0/0` and zero denominators are unknown
pub fn parse_fraction(value: Option<&str>) -> Option<f64> {
    let text = value?.trim();
    if text.is_empty() || text == "0/0" {
        return None;
    }
    match text.split_once('/') {
        Some((num, den)) => {
            let num = num.trim().parse::<f64>().ok()?;
            let den = den.trim().parse::<f64>().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => text.parse::<f64>().ok(),
    }
}

fn normalize_color(value: Option<String>) -> Option<String> {
    let cleaned = value?.trim().to_string();
    match cleaned.to_ascii_lowercase().as_str() {
        "" | "unknown" | "unspecified" | "unknown/unknown" => None,
        _ => Some(cleaned),
    }
}

/// Bits per sample, preferring the explicit field over the pixel format name
fn infer_bit_depth(pix_fmt: Option<&str>, bits_per_raw_sample: Option<&str>) -> Option<u32> {
    if let Some(bits) = bits_per_raw_sample
        .and_then(|b| b.trim().parse::<f64>().ok())
        .filter(|b| *b > 0.0)
    {
        return Some(bits as u32);
    }

    // yuv420p10le -> 10, yuv422p -> 8 implied, gbrp12le -> 12
    let pix_fmt = pix_fmt?;
    let idx = pix_fmt.find('p')?;
    let digits: String = pix_fmt[idx + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        if pix_fmt.starts_with("yuv") || pix_fmt.starts_with("nv12") {
            return Some(8);
        }
        return None;
    }
    digits.parse().ok()
}

// JSON deserialization structures

#[derive(Debug, Default, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<VideoStream>,
    format: Option<FormatInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct FormatInfo {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideoStream {
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    bits_per_raw_sample: Option<String>,
    color_primaries: Option<String>,
    color_transfer: Option<String>,
    color_space: Option<String>,
    color_range: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    bit_rate: Option<String>,
    duration: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "programs": [],
        "streams": [{
            "width": 3840,
            "height": 2160,
            "pix_fmt": "yuv422p10le",
            "color_range": "tv",
            "color_space": "bt709",
            "color_transfer": "bt709",
            "color_primaries": "bt709",
            "r_frame_rate": "24/1",
            "avg_frame_rate": "30000/1001",
            "duration": "12.500000",
            "bit_rate": "150000000"
        }],
        "format": { "duration": "12.600000", "bit_rate": "151000000" }
    }"#;

    #[test]
    fn parses_stream_fields() {
        let d = parse_probe_output(SAMPLE).unwrap();
        assert_eq!(d.width, Some(3840));
        assert_eq!(d.height, Some(2160));
        assert_eq!(d.bit_depth, Some(10));
        assert_eq!(d.duration_secs, Some(12.5));
        assert_eq!(d.bitrate, Some(150_000_000));
        assert_eq!(d.color.matrix.as_deref(), Some("bt709"));
        assert!(d.is_variable_frame_rate());
        assert!((d.fps().unwrap() - 29.97).abs() < 0.01);
    }

    #[test]
    fn falls_back_to_format_values() {
        let json = r#"{"streams":[{"width":1920,"height":1080,"pix_fmt":"yuvj420p",
            "avg_frame_rate":"0/0","r_frame_rate":"25/1","color_space":"unknown"}],
            "format":{"duration":"3.0","bit_rate":"8000000"}}"#;
        let d = parse_probe_output(json).unwrap();
        assert_eq!(d.duration_secs, Some(3.0));
        assert_eq!(d.bitrate, Some(8_000_000));
        assert_eq!(d.avg_fps, None);
        assert_eq!(d.fps(), Some(25.0));
        assert_eq!(d.color.matrix, None);
        assert_eq!(d.color.range.as_deref(), Some("pc"));
        assert_eq!(d.bit_depth, Some(8));
    }

    #[test]
    fn empty_output_is_an_empty_descriptor() {
        let d = parse_probe_output("").unwrap();
        assert_eq!(d, SourceDescriptor::default());
    }

    #[test]
    fn garbage_is_a_probe_error() {
        let err = parse_probe_output("not json").unwrap_err();
        assert!(matches!(err, AppError::Probe(_)));
    }

    #[test]
    fn fractions() {
        assert_eq!(parse_fraction(Some("24000/1001")).map(|f| (f * 1000.0).round()), Some(23976.0));
        assert_eq!(parse_fraction(Some("25")), Some(25.0));
        assert_eq!(parse_fraction(Some("1/0")), None);
        assert_eq!(parse_fraction(Some("0/0")), None);
        assert_eq!(parse_fraction(None), None);
    }

    #[test]
    fn bit_depth_prefers_raw_sample_field() {
        assert_eq!(infer_bit_depth(Some("yuv420p"), Some("10")), Some(10));
        assert_eq!(infer_bit_depth(Some("yuv420p12le"), None), Some(12));
        assert_eq!(infer_bit_depth(None, None), None);
    }
}
