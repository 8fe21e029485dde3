use crate::analyzer::SourceDescriptor;
use crate::error::Result;
use serde::de::{DeserializeOwned, IntoDeserializer, value::StrDeserializer};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Single-pass delivery or ProRes master followed by a distribution encode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Fast,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitDepthPolicy {
    #[default]
    Preserve,
    #[serde(rename = "force_8bit", alias = "force8bit")]
    Force8Bit,
}

/// Interpolation used by the 3D LUT filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LutInterpolation {
    Nearest,
    Trilinear,
    #[default]
    Tetrahedral,
    Pyramid,
    Prism,
    Cubic,
}

impl LutInterpolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LutInterpolation::Nearest => "nearest",
            LutInterpolation::Trilinear => "trilinear",
            LutInterpolation::Tetrahedral => "tetrahedral",
            LutInterpolation::Pyramid => "pyramid",
            LutInterpolation::Prism => "prism",
            LutInterpolation::Cubic => "cubic",
        }
    }
}

/// Which YUV->RGB matrix feeds the LUT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LutInputMatrix {
    /// Follow the source's matrix tag when it is recognised
    #[default]
    Auto,
    #[serde(rename = "force_bt709", alias = "bt709")]
    ForceBt709,
    None,
}

/// Color tags written on the output after a LUT transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LutOutputTags {
    /// Rec.709 primaries/transfer/matrix, limited range
    #[default]
    Bt709,
    Inherit,
    None,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::Fast => write!(f, "fast"),
            ProcessingMode::Pro => write!(f, "pro"),
        }
    }
}

/// Everything that shapes the output of one job
///
/// Free-form encoder knobs are kept as strings and passed through verbatim;
/// an empty string means the same as an unset field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParams {
    pub video_codec: String,
    pub audio_codec: String,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub pix_fmt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub bitrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub fps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub crf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub tune: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_u32")]
    pub gop: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_u32")]
    pub threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_string")]
    pub audio_bitrate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_u32")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "loose_u32")]
    pub channels: Option<u32>,
    pub faststart: bool,
    pub overwrite: bool,
    pub generate_cover: bool,
    #[serde(deserialize_with = "lenient")]
    pub processing_mode: ProcessingMode,
    #[serde(deserialize_with = "lenient")]
    pub bit_depth_policy: BitDepthPolicy,
    pub force_cfr: bool,
    pub inherit_color_metadata: bool,
    #[serde(alias = "lut_interp", deserialize_with = "lenient")]
    pub lut_interpolation: LutInterpolation,
    #[serde(alias = "lut_input_matrix", deserialize_with = "lenient")]
    pub lut_input_matrix_policy: LutInputMatrix,
    #[serde(alias = "lut_output_tags", deserialize_with = "lenient")]
    pub lut_output_tag_policy: LutOutputTags,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            pix_fmt: None,
            resolution: None,
            bitrate: None,
            fps: None,
            crf: None,
            preset: None,
            tune: None,
            gop: None,
            profile: None,
            level: None,
            threads: None,
            audio_bitrate: None,
            sample_rate: None,
            channels: None,
            faststart: false,
            overwrite: true,
            generate_cover: false,
            processing_mode: ProcessingMode::default(),
            bit_depth_policy: BitDepthPolicy::default(),
            force_cfr: true,
            inherit_color_metadata: true,
            lut_interpolation: LutInterpolation::default(),
            lut_input_matrix_policy: LutInputMatrix::default(),
            lut_output_tag_policy: LutOutputTags::default(),
        }
    }
}

impl ProcessingParams {
    /// Flat key-value form used by presets and settings
    pub fn to_representation(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // Plain struct of strings, numbers and bools always serializes to an object
            _ => Map::new(),
        }
    }

    /// Missing keys take their defaults
    pub fn from_representation(map: &Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(map.clone()))?)
    }

    /// Apply `key=value` overrides on top of these params.
    /// Values that parse as JSON (numbers, booleans) are used as such, anything else is a string.
    pub fn with_overrides<'a>(
        &self,
        overrides: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut map = self.to_representation();
        for (key, raw) in overrides {
            let value = serde_json::from_str::<Value>(raw)
                .ok()
                .filter(|v| !v.is_object() && !v.is_array())
                .unwrap_or_else(|| Value::String(raw.to_string()));
            map.insert(key.trim().to_string(), value);
        }
        Self::from_representation(&map)
    }

    /// Copy source resolution and bitrate into unset fields. Returns what was applied.
    pub fn fill_from_source(&mut self, source: &SourceDescriptor) -> Vec<String> {
        let mut applied = Vec::new();
        if self.is_stream_copy() {
            return applied;
        }
        if set(&self.resolution).is_none()
            && let Some(resolution) = source.resolution_string()
        {
            applied.push(format!("resolution={}", resolution));
            self.resolution = Some(resolution);
        }
        if set(&self.bitrate).is_none()
            && let Some(bitrate) = source.bitrate_string()
        {
            applied.push(format!("bitrate={}", bitrate));
            self.bitrate = Some(bitrate);
        }
        applied
    }

    pub fn is_stream_copy(&self) -> bool {
        self.video_codec == "copy"
    }
}

/// Treat `Some("")` the same as `None`
pub fn set(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Accept strings or bare numbers, e.g. `crf = 23` in TOML
fn loose_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Loose>::deserialize(deserializer)?.map(|v| match v {
        Loose::Text(s) => s,
        Loose::Int(i) => i.to_string(),
        Loose::Float(f) => f.to_string(),
    }))
}

/// Numbers or numeric strings; empty and unparseable strings are unset
fn loose_u32<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Loose>::deserialize(deserializer)?.and_then(|v| match v {
        Loose::Text(s) => s.trim().parse().ok(),
        Loose::Int(i) => u32::try_from(i).ok(),
        Loose::Float(f) if f >= 0.0 && f.fract() == 0.0 => Some(f as u32),
        Loose::Float(_) => None,
    }))
}

/// Unknown policy names fall back to the default instead of failing the whole set
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let raw = String::deserialize(deserializer)?;
    let normalized = raw.trim().to_ascii_lowercase();
    let de: StrDeserializer<'_, serde::de::value::Error> = normalized.as_str().into_deserializer();
    Ok(T::deserialize(de).unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Text(String),
    Int(i64),
    Float(f64),
}
