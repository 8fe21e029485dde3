use crate::analyzer::SourceDescriptor;
use crate::encoder::params::{BitDepthPolicy, LutInputMatrix, LutOutputTags, ProcessingParams, set};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Encoder used when stream-copy was requested together with pixel processing
pub const FALLBACK_VIDEO_ENCODER: &str = "libx264";

static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)([kKmMgG]?)\s*$").unwrap());

const TEN_BIT_ENCODERS: [&str; 9] = [
    "prores_ks",
    "prores_aw",
    "prores",
    "libx265",
    "hevc_videotoolbox",
    "hevc_nvenc",
    "libsvtav1",
    "libaom-av1",
    "libvpx-vp9",
];

/// Build transcoder arguments (without the program name) for one encode.
///
/// Every decision that was not spelled out in `params` leaves a short note in `notes`.
pub fn build_command(
    source: &Path,
    destination: &Path,
    params: &ProcessingParams,
    lut_path: Option<&Path>,
    descriptor: Option<&SourceDescriptor>,
    notes: &mut Vec<String>,
) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string()];
    args.push(if params.overwrite { "-y" } else { "-n" }.to_string());
    args.extend(["-i".to_string(), source.to_string_lossy().to_string()]);

    let mut filters = match lut_path {
        Some(lut) => build_lut_filters(lut, params, descriptor, notes),
        None => Vec::new(),
    };

    // Stream-copy cannot go through a filter graph, so swap in a real encoder
    let mut video_codec = params.video_codec.trim().to_string();
    let wants_pixel_processing = lut_path.is_some()
        || set(&params.pix_fmt).is_some()
        || set(&params.resolution).is_some();
    if video_codec == "copy" && wants_pixel_processing {
        notes.push(format!(
            "Video stream-copy cannot be combined with LUT/pixel filters; encoding with {} instead",
            FALLBACK_VIDEO_ENCODER
        ));
        video_codec = FALLBACK_VIDEO_ENCODER.to_string();
    }

    if !video_codec.is_empty() {
        args.extend(["-c:v".to_string(), video_codec.clone()]);
    }
    let audio_codec = params.audio_codec.trim();
    if !audio_codec.is_empty() {
        args.extend(["-c:a".to_string(), audio_codec.to_string()]);
    }

    if !video_codec.is_empty() && video_codec != "copy" {
        let fps_value = push_timing(&mut args, params, descriptor, notes);

        if let Some(pix_fmt) = resolve_pixel_format(&video_codec, params, descriptor, notes) {
            if lut_path.is_some() {
                filters.push(format!("format={}", pix_fmt));
            }
            args.extend(["-pix_fmt".to_string(), pix_fmt]);
        }

        if let Some(resolution) = set(&params.resolution) {
            args.extend(["-s".to_string(), resolution.to_string()]);
        }

        if let Some(bitrate) = set(&params.bitrate) {
            args.extend(["-b:v".to_string(), bitrate.to_string()]);
            match scale_bitrate(bitrate, 2.0) {
                Some(bufsize) => {
                    args.extend([
                        "-maxrate".to_string(),
                        bitrate.to_string(),
                        "-bufsize".to_string(),
                        bufsize.clone(),
                    ]);
                    notes.push(format!(
                        "Rate control: maxrate={}, bufsize={}",
                        bitrate, bufsize
                    ));
                }
                None => notes.push(format!(
                    "Rate control: could not read bitrate '{}', maxrate/bufsize not set",
                    bitrate
                )),
            }
        }

        push_opt(&mut args, "-crf", set(&params.crf));
        push_opt(&mut args, "-preset", set(&params.preset));
        push_opt(&mut args, "-tune", set(&params.tune));

        match (params.gop, fps_value) {
            (Some(gop), _) => args.extend(["-g".to_string(), gop.to_string()]),
            (None, Some(fps)) => {
                let gop = (fps.round() as u32).max(1);
                args.extend(["-g".to_string(), gop.to_string()]);
                notes.push(format!("Auto GOP={} (fps={})", gop, format_float(fps)));
            }
            (None, None) => {}
        }

        push_opt(&mut args, "-profile:v", set(&params.profile));
        push_opt(&mut args, "-level", set(&params.level));
        if let Some(threads) = params.threads {
            args.extend(["-threads".to_string(), threads.to_string()]);
        }

        if lut_path.is_some() {
            match params.lut_output_tag_policy {
                LutOutputTags::Bt709 => {
                    args.extend(bt709_tags());
                    notes.push("LUT output tags: bt709/bt709/bt709, range=tv".to_string());
                }
                LutOutputTags::Inherit => {
                    if params.inherit_color_metadata {
                        push_source_color_tags(&mut args, descriptor, notes);
                    }
                }
                LutOutputTags::None => {
                    notes.push("LUT output tags: none (no color metadata written)".to_string());
                }
            }
        } else if params.inherit_color_metadata {
            push_source_color_tags(&mut args, descriptor, notes);
        }

        if video_codec.contains("videotoolbox") {
            let candidate = set(&params.bitrate)
                .map(str::to_string)
                .or_else(|| descriptor.and_then(|d| d.bitrate_string()));
            if candidate
                .as_deref()
                .and_then(bitrate_to_kbps)
                .is_some_and(|kbps| kbps >= 50_000.0)
            {
                notes.push(
                    "Hint: videotoolbox encoders may reorder frames under heavy high-bitrate load; \
                     prefer libx264 or pro mode for stable cadence"
                        .to_string(),
                );
            }
        }
    }

    if !filters.is_empty() {
        args.extend(["-vf".to_string(), filters.join(",")]);
    }

    if !audio_codec.is_empty() && audio_codec != "copy" {
        push_opt(&mut args, "-b:a", set(&params.audio_bitrate));
        if let Some(rate) = params.sample_rate {
            args.extend(["-ar".to_string(), rate.to_string()]);
        }
        if let Some(channels) = params.channels {
            args.extend(["-ac".to_string(), channels.to_string()]);
        }
    }

    if params.faststart {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.push(destination.to_string_lossy().to_string());
    args
}

/// Range normalization, matrix pinning and the LUT itself
fn build_lut_filters(
    lut: &Path,
    params: &ProcessingParams,
    descriptor: Option<&SourceDescriptor>,
    notes: &mut Vec<String>,
) -> Vec<String> {
    let mut filters = Vec::new();

    let matrix = match params.lut_input_matrix_policy {
        LutInputMatrix::ForceBt709 => Some("bt709"),
        LutInputMatrix::Auto => descriptor.and_then(|d| scale_matrix(d.color.matrix.as_deref())),
        LutInputMatrix::None => None,
    };
    let policy_name = match params.lut_input_matrix_policy {
        LutInputMatrix::ForceBt709 => "force_bt709",
        LutInputMatrix::Auto => "auto",
        LutInputMatrix::None => "none",
    };

    if let Some(source) = descriptor.filter(|d| d.is_full_range()) {
        let out_range = match params.lut_output_tag_policy {
            LutOutputTags::Bt709 => "tv".to_string(),
            LutOutputTags::Inherit => source
                .color
                .range
                .as_deref()
                .map(|r| r.trim().to_ascii_lowercase())
                .unwrap_or_else(|| "pc".to_string()),
            LutOutputTags::None => "pc".to_string(),
        };
        let planar = planar_format_for(source.pixel_format.as_deref());
        let mut scale = vec!["in_range=pc".to_string(), format!("out_range={}", out_range)];
        if let Some(m) = matrix {
            scale.push(format!("in_color_matrix={m}:out_color_matrix={m}"));
            notes.push(format!("LUT input matrix: {} ({})", m, policy_name));
        }
        notes.push(format!(
            "Range: full-range source normalized to out_range={} before the LUT (format={})",
            out_range, planar
        ));
        filters.push(format!("scale={}", scale.join(":")));
        filters.push(format!("format={}", planar));
    } else if let Some(m) = matrix {
        filters.push(format!("scale=in_color_matrix={m}:out_color_matrix={m}"));
        notes.push(format!("LUT input matrix: {} ({})", m, policy_name));
    } else {
        notes.push(format!(
            "LUT input matrix: not pinned ({}, source matrix unknown or unsupported)",
            policy_name
        ));
    }

    let interp = params.lut_interpolation.as_str();
    filters.push(format!(
        "lut3d=file={}:interp={}",
        escape_filter_path(lut),
        interp
    ));
    notes.push(format!("LUT: lut3d (interp={})", interp));
    filters
}

/// Output timing; returns the frame rate the output is expected to have
fn push_timing(
    args: &mut Vec<String>,
    params: &ProcessingParams,
    descriptor: Option<&SourceDescriptor>,
    notes: &mut Vec<String>,
) -> Option<f64> {
    if let Some(fps) = set(&params.fps) {
        args.extend(["-fps_mode".into(), "cfr".into(), "-r".into(), fps.to_string()]);
        notes.push(format!("Timing: fps_mode=cfr, output rate={}", fps));
        return parse_rate(fps);
    }

    let source_fps = descriptor.and_then(|d| d.fps());
    match descriptor {
        Some(source) if source.is_variable_frame_rate() && params.force_cfr => {
            args.extend(["-fps_mode".to_string(), "cfr".to_string()]);
            match source_fps {
                Some(fps) => {
                    let text = format_float(fps);
                    args.extend(["-r".to_string(), text.clone()]);
                    notes.push(format!("Timing: VFR source forced to CFR at {}", text));
                }
                None => notes.push("Timing: VFR source forced to CFR (rate unknown)".to_string()),
            }
        }
        None if params.force_cfr => {
            args.extend(["-fps_mode".to_string(), "cfr".to_string()]);
            notes.push("Timing: fps_mode=cfr (source not probed)".to_string());
        }
        Some(source) => {
            args.extend(["-fps_mode".to_string(), "passthrough".to_string()]);
            if source.is_variable_frame_rate() {
                notes.push("Timing: VFR source, fps_mode=passthrough".to_string());
            } else {
                notes.push("Timing: CFR source, fps_mode=passthrough".to_string());
            }
        }
        None => {
            args.extend(["-fps_mode".to_string(), "passthrough".to_string()]);
        }
    }
    source_fps
}

fn resolve_pixel_format(
    codec: &str,
    params: &ProcessingParams,
    descriptor: Option<&SourceDescriptor>,
    notes: &mut Vec<String>,
) -> Option<String> {
    let explicit = set(&params.pix_fmt);
    match params.bit_depth_policy {
        BitDepthPolicy::Force8Bit => {
            let chosen = explicit
                .filter(|p| pixel_format_depth(p) == 8)
                .unwrap_or("yuv420p");
            if explicit != Some(chosen) {
                notes.push(format!("Bit depth: forced 8-bit, pix_fmt={}", chosen));
            }
            Some(chosen.to_string())
        }
        BitDepthPolicy::Preserve => {
            if let Some(p) = explicit {
                return Some(p.to_string());
            }
            if !descriptor.is_some_and(|d| d.is_high_bit_depth()) {
                return None;
            }
            if TEN_BIT_ENCODERS.contains(&codec) {
                let p = if codec.starts_with("prores") {
                    "yuv422p10le"
                } else {
                    "yuv420p10le"
                };
                notes.push(format!("Bit depth: preserving 10-bit, pix_fmt={}", p));
                Some(p.to_string())
            } else {
                notes.push(format!(
                    "Bit depth: {} has no 10-bit output, pixel format left to the encoder",
                    codec
                ));
                None
            }
        }
    }
}

fn push_source_color_tags(
    args: &mut Vec<String>,
    descriptor: Option<&SourceDescriptor>,
    notes: &mut Vec<String>,
) {
    let Some(source) = descriptor else {
        return;
    };
    if source.color.is_empty() {
        notes.push("Color metadata: source has no tags to inherit".to_string());
        return;
    }
    let mut items = Vec::new();
    for (flag, label, value) in [
        ("-color_primaries", "primaries", &source.color.primaries),
        ("-color_trc", "trc", &source.color.transfer),
        ("-colorspace", "colorspace", &source.color.matrix),
        ("-color_range", "range", &source.color.range),
    ] {
        if let Some(v) = value {
            args.extend([flag.to_string(), v.clone()]);
            items.push(format!("{}={}", label, v));
        }
    }
    if !items.is_empty() {
        notes.push(format!("Color metadata inherited: {}", items.join(", ")));
    }
}

fn bt709_tags() -> [String; 8] {
    [
        "-color_primaries".to_string(),
        "bt709".to_string(),
        "-color_trc".to_string(),
        "bt709".to_string(),
        "-colorspace".to_string(),
        "bt709".to_string(),
        "-color_range".to_string(),
        "tv".to_string(),
    ]
}

fn push_opt(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value {
        args.extend([flag.to_string(), v.to_string()]);
    }
}

/// Matrices the scale filter understands
fn scale_matrix(value: Option<&str>) -> Option<&'static str> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "bt709" => Some("bt709"),
        "smpte170m" => Some("smpte170m"),
        "bt470bg" => Some("bt470bg"),
        "bt2020nc" => Some("bt2020nc"),
        "bt2020c" => Some("bt2020c"),
        _ => None,
    }
}

/// Non-legacy planar format with the same chroma layout as the source
fn planar_format_for(pix_fmt: Option<&str>) -> &'static str {
    let pix_fmt = pix_fmt.unwrap_or_default();
    if pix_fmt.contains("444") {
        "yuv444p"
    } else if pix_fmt.contains("422") {
        "yuv422p"
    } else {
        "yuv420p"
    }
}

fn pixel_format_depth(pix_fmt: &str) -> u32 {
    let digits: String = pix_fmt
        .rsplit_once('p')
        .map(|(_, tail)| tail.chars().take_while(|c| c.is_ascii_digit()).collect())
        .unwrap_or_default();
    digits.parse().unwrap_or(8)
}

/// Quote a path for use inside a filtergraph option value
/// Escape a path for a filter option inside a `-vf` graph.
///
/// The option parser needs `\`, `'` and `:` backslash-escaped. The graph parser
/// then gets the result single-quoted, each embedded quote spliced in as `'\''`.
fn escape_filter_path(path: &Path) -> String {
    let mut value = String::new();
    for c in path.to_string_lossy().chars() {
        if matches!(c, '\\' | '\'' | ':') {
            value.push('\\');
        }
        value.push(c);
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn parse_rate(value: &str) -> Option<f64> {
    crate::analyzer::ffprobe::parse_fraction(Some(value)).filter(|f| *f > 0.0)
}

/// Up to three decimals, without trailing zeros
pub fn format_float(value: f64) -> String {
    let text = format!("{:.3}", value);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn parse_bitrate(value: &str) -> Option<(f64, String)> {
    let caps = BITRATE_RE.captures(value)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    if number <= 0.0 {
        return None;
    }
    Some((number, caps.get(2).map_or("", |m| m.as_str()).to_string()))
}

/// Multiply a bitrate while keeping its unit, e.g. `4000k` x2 = `8000k`
pub fn scale_bitrate(value: &str, factor: f64) -> Option<String> {
    let (number, unit) = parse_bitrate(value)?;
    let scaled = number * factor;
    if (scaled - scaled.round()).abs() < 1e-6 {
        Some(format!("{}{}", scaled.round() as u64, unit))
    } else {
        Some(format!("{}{}", scaled, unit))
    }
}

fn bitrate_to_kbps(value: &str) -> Option<f64> {
    let (number, unit) = parse_bitrate(value)?;
    match unit.to_ascii_lowercase().as_str() {
        "" => Some(number / 1000.0),
        "k" => Some(number),
        "m" => Some(number * 1000.0),
        "g" => Some(number * 1_000_000.0),
        _ => None,
    }
}
