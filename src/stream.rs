use crate::config::StreamDefaults;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const ALLOWED_VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "flv", "m4v"];

pub const RESOLUTIONS: &[&str] = &["480", "720", "1080", "1440", "2160"];

/// 时长上限 (一年)，更大的值按无效处理
pub const MAX_DURATION_HOURS: f64 = 8760.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    #[serde(alias = "rtsp")]
    Network,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_lowercase().as_str() {
            "file" => Ok(SourceKind::File),
            "network" | "rtsp" => Ok(SourceKind::Network),
            other => Err(ValidationError::BadSourceKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Mpeg4,
}

impl VideoCodec {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim().to_lowercase().as_str() {
            "h264" => Ok(VideoCodec::H264),
            "h265" | "hevc" => Ok(VideoCodec::H265),
            "mpeg4" => Ok(VideoCodec::Mpeg4),
            other => Err(ValidationError::BadCodec(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Mpeg4 => "mpeg4",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一路流的不可变描述，校验一次后在进程生命周期内不再改变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub source_kind: SourceKind,
    /// 文件路径或网络地址
    pub source: String,
    pub video_codec: VideoCodec,
    pub resolution: String,
    /// 原始帧率字符串，无法使用时命令构建回退到 15
    pub target_fps: String,
    pub audio_enabled: bool,
    pub audio_codec: String,
    pub hardware_accel: bool,
    /// 0 表示不限时长
    pub duration_hours: f64,
}

impl StreamSpec {
    /// 时长上限，不限时为 `None`。超出上限的值按上限计算
    pub fn duration(&self) -> Option<Duration> {
        if self.duration_hours > 0.0 && self.duration_hours.is_finite() {
            Duration::try_from_secs_f64(self.duration_hours.min(MAX_DURATION_HOURS) * 3600.0).ok()
        } else {
            None
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.duration().is_none()
    }

    /// 替换时长后的副本，恢复持久化的流时使用剩余时长
    pub fn with_duration_hours(&self, hours: f64) -> Self {
        Self {
            duration_hours: hours.clamp(0.0, MAX_DURATION_HOURS),
            ..self.clone()
        }
    }

    /// 文件源已不存在
    pub fn source_missing(&self) -> bool {
        self.source_kind == SourceKind::File && !Path::new(&self.source).exists()
    }
}

/// 控制面传入的启动请求，字段均为原始字符串
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamRequest {
    pub stream_name: String,
    pub stream_type: String,
    pub source_url: Option<String>,
    pub video_file_path: Option<String>,
    pub video_codec: Option<String>,
    pub resolution: Option<String>,
    pub target_fps: Option<String>,
    pub audio_enabled: Option<String>,
    pub audio_codec: Option<String>,
    pub hardware_accel: Option<String>,
    pub duration_hours: Option<String>,
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::BadName(name.to_string()))
    }
}

fn yes(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("yes" | "true" | "1" | "on")
    )
}

impl StreamRequest {
    /// 结合默认值解析并校验全部字段，无副作用
    pub fn into_spec(self, defaults: &StreamDefaults) -> Result<StreamSpec, ValidationError> {
        validate_name(&self.stream_name)?;
        let source_kind = SourceKind::parse(&self.stream_type)?;

        let source = match source_kind {
            SourceKind::Network => {
                let url = self.source_url.unwrap_or_default();
                if url.trim().is_empty() {
                    return Err(ValidationError::MissingUrl);
                }
                url.trim().to_string()
            }
            SourceKind::File => {
                let path = self.video_file_path.unwrap_or_default();
                if path.trim().is_empty() {
                    return Err(ValidationError::MissingFile);
                }
                validate_video_file(path.trim())?;
                path.trim().to_string()
            }
        };

        let resolution = self
            .resolution
            .unwrap_or_else(|| defaults.resolution.clone());
        if !RESOLUTIONS.contains(&resolution.as_str()) {
            return Err(ValidationError::BadResolution(resolution));
        }

        let video_codec = VideoCodec::parse(
            self.video_codec
                .as_deref()
                .unwrap_or(defaults.video_codec.as_str()),
        )?;

        let duration_hours = match self.duration_hours.as_deref().map(str::trim) {
            None | Some("") => defaults.duration_hours,
            Some(raw) => match raw.parse::<f64>() {
                Ok(hours) if (0.0..=MAX_DURATION_HOURS).contains(&hours) => hours,
                _ => return Err(ValidationError::BadDuration(raw.to_string())),
            },
        };

        Ok(StreamSpec {
            name: self.stream_name,
            source_kind,
            source,
            video_codec,
            resolution,
            target_fps: self.target_fps.unwrap_or_else(|| defaults.fps.clone()),
            audio_enabled: yes(self.audio_enabled.as_deref()),
            audio_codec: self
                .audio_codec
                .unwrap_or_else(|| defaults.audio_codec.clone()),
            hardware_accel: yes(self.hardware_accel.as_deref()),
            duration_hours,
        })
    }
}

fn validate_video_file(path: &str) -> Result<(), ValidationError> {
    let p = Path::new(path);
    if !p.exists() {
        return Err(ValidationError::FileNotFound(path.to_string()));
    }
    if !p.is_file() {
        return Err(ValidationError::NotAFile(path.to_string()));
    }
    let ext = p
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if !ALLOWED_VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ValidationError::BadExtension {
            path: path.to_string(),
            allowed: ALLOWED_VIDEO_EXTENSIONS.join(", "),
        });
    }
    Ok(())
}
