use crate::capability::{Backend, EncoderProfile};
use crate::config::ServerConfig;
use crate::stream::{SourceKind, StreamSpec, VideoCodec};

pub const DEFAULT_FPS: u32 = 15;
/// 帧率上限，更大的输入按此值处理
pub const MAX_FPS: u32 = 240;
const REFERENCE_FPS: f64 = 15.0;
const MIN_FPS_SCALE: f64 = 0.5;
const MAX_FPS_SCALE: f64 = 2.0;

const HOSTED_VIDEO_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "youtube-nocookie.com"];

/// 依赖主机环境的构建参数，启动时解析一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub transcoder: String,
    /// `timeout` 一类的限时包装，不可用或关闭时为 `None`
    pub time_limiter: Option<String>,
    pub rtsp_host: String,
    pub rtsp_port: u16,
    pub render_node: String,
}

impl BuildContext {
    pub fn from_config(server: &ServerConfig) -> Self {
        let time_limiter = if server.use_time_limiter && cfg!(unix) {
            ["timeout", "gtimeout"]
                .into_iter()
                .find(|bin| which::which(bin).is_ok())
                .map(str::to_string)
        } else {
            None
        };

        Self {
            transcoder: server.transcoder_binary.clone(),
            time_limiter,
            rtsp_host: server.rtsp_host.clone(),
            rtsp_port: server.rtsp_port,
            render_node: server.render_node.clone(),
        }
    }

    pub fn rtsp_url(&self, name: &str) -> String {
        format!("rtsp://{}:{}/{}", self.rtsp_host, self.rtsp_port, name)
    }
}

/// 以参数列表表示的进程命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// `-i` 参数值在 `args` 中的下标
    pub input_slot: usize,
    /// 输入为视频站页面时设置，启动前需解析成直链
    pub hosted_source: Option<String>,
}

impl Invocation {
    /// 替换输入地址
    pub fn with_resolved_input(mut self, url: &str) -> Self {
        if let Some(slot) = self.args.get_mut(self.input_slot) {
            *slot = url.to_string();
        }
        self.hosted_source = None;
        self
    }

    /// 单行形式，仅用于日志和崩溃报告
    pub fn render(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(token: &str) -> String {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
    if safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

/// 分辨率名对应的像素尺寸，未知名称按 1080p
pub fn dimensions(resolution: &str) -> (u32, u32) {
    match resolution {
        "480" => (854, 480),
        "720" => (1280, 720),
        "1440" => (2560, 1440),
        "2160" => (3840, 2160),
        _ => (1920, 1080),
    }
}

/// 目标帧率。无法解析或小于 1 时取 [`DEFAULT_FPS`]，超出 [`MAX_FPS`] 时截断
pub fn parse_fps(raw: &str) -> u32 {
    match raw.trim().parse::<f64>() {
        Ok(fps) if fps.is_finite() && fps >= 1.0 => fps.min(MAX_FPS as f64) as u32,
        _ => DEFAULT_FPS,
    }
}

/// 参考帧率下的基础码率 (kbps)
fn base_kbps(codec: VideoCodec, resolution: &str) -> u32 {
    let table: [u32; 5] = match codec {
        VideoCodec::H264 => [800, 1500, 2500, 4500, 9000],
        VideoCodec::H265 => [500, 900, 1600, 3000, 6000],
        VideoCodec::Mpeg4 => [1000, 2000, 4000, 7000, 12000],
    };
    let idx = match resolution {
        "480" => 0,
        "720" => 1,
        "1440" => 3,
        "2160" => 4,
        _ => 2,
    };
    table[idx]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateControl {
    pub target_kbps: u32,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
    pub gop: u32,
}

pub fn rate_control(codec: VideoCodec, resolution: &str, fps: u32) -> RateControl {
    let scale = (fps as f64 / REFERENCE_FPS).clamp(MIN_FPS_SCALE, MAX_FPS_SCALE);
    let target_kbps = (base_kbps(codec, resolution) as f64 * scale) as u32;
    let maxrate_kbps = (target_kbps as f64 * 1.2) as u32;
    RateControl {
        target_kbps,
        maxrate_kbps,
        bufsize_kbps: maxrate_kbps * 2,
        gop: fps.saturating_mul(2).max(2),
    }
}

pub fn is_hosted_video(url: &str) -> bool {
    let lower = url.to_lowercase();
    HOSTED_VIDEO_DOMAINS.iter().any(|d| lower.contains(d))
}

fn push(args: &mut Vec<String>, tokens: &[&str]) {
    args.extend(tokens.iter().map(|t| t.to_string()));
}

pub fn build_invocation(spec: &StreamSpec, profile: &EncoderProfile, ctx: &BuildContext) -> Invocation {
    let (width, height) = dimensions(&spec.resolution);
    let size = format!("{}x{}", width, height);
    let fps = parse_fps(&spec.target_fps);
    let rc = rate_control(spec.video_codec, &spec.resolution, fps);
    let kbps = |v: u32| format!("{}k", v);

    let mut args: Vec<String> = Vec::new();

    let program = match (&ctx.time_limiter, spec.duration()) {
        (Some(limiter), Some(limit)) => {
            args.push(limit.as_secs_f64().ceil().to_string());
            args.push(ctx.transcoder.clone());
            limiter.clone()
        }
        _ => ctx.transcoder.clone(),
    };

    push(&mut args, &["-hide_banner", "-loglevel", "warning"]);

    if profile.backend == Backend::Vaapi {
        push(&mut args, &["-hwaccel", "vaapi", "-hwaccel_device"]);
        args.push(ctx.render_node.clone());
        push(&mut args, &["-hwaccel_output_format", "vaapi"]);
    }

    let mut hosted_source = None;
    match spec.source_kind {
        SourceKind::File => push(&mut args, &["-re", "-stream_loop", "-1", "-i"]),
        SourceKind::Network => {
            if is_hosted_video(&spec.source) {
                hosted_source = Some(spec.source.clone());
            }
            push(&mut args, &["-re", "-i"]);
        }
    }
    let input_slot = args.len();
    args.push(spec.source.clone());

    match profile.backend {
        Backend::Nvenc => {
            push(&mut args, &["-c:v", &profile.encoder]);
            push(&mut args, &["-preset", "llhq", "-rc:v", "vbr", "-cq:v", "19"]);
            push(&mut args, &["-b:v", &kbps(rc.target_kbps)]);
            push(&mut args, &["-maxrate", &kbps(rc.maxrate_kbps)]);
            push(&mut args, &["-bufsize", &kbps(rc.bufsize_kbps)]);
        }
        Backend::Vaapi => {
            let upload = if spec.video_codec == VideoCodec::H265 {
                "format=nv12|vaapi,hwupload"
            } else {
                "format=nv12,hwupload"
            };
            let filter = format!(
                "{},scale_vaapi=w={}:h={}:force_original_aspect_ratio=decrease",
                upload, width, height
            );
            push(&mut args, &["-vf", &filter, "-c:v", &profile.encoder]);
            push(&mut args, &["-qp", "23"]);
            push(&mut args, &["-b:v", &kbps(rc.target_kbps)]);
            push(&mut args, &["-maxrate", &kbps(rc.maxrate_kbps)]);
        }
        Backend::Software => {
            push(&mut args, &["-c:v", &profile.encoder]);
            match spec.video_codec {
                VideoCodec::H264 => push(
                    &mut args,
                    &["-preset", "veryfast", "-profile:v", "baseline", "-level", "3.0"],
                ),
                VideoCodec::H265 => push(
                    &mut args,
                    &[
                        "-preset",
                        "veryfast",
                        "-tune",
                        "zerolatency",
                        "-profile:v",
                        "main",
                        "-level",
                        "4.0",
                    ],
                ),
                VideoCodec::Mpeg4 => {}
            }
            push(&mut args, &["-b:v", &kbps(rc.target_kbps)]);
            push(&mut args, &["-maxrate", &kbps(rc.maxrate_kbps)]);
            push(&mut args, &["-bufsize", &kbps(rc.bufsize_kbps)]);
            push(&mut args, &["-pix_fmt", "yuv420p"]);
            if spec.video_codec == VideoCodec::H264 {
                push(&mut args, &["-movflags", "+faststart"]);
            }
        }
    }

    let gop = rc.gop.to_string();
    push(&mut args, &["-b_strategy", "0", "-bf", "0"]);
    push(&mut args, &["-g", &gop, "-keyint_min", &gop]);
    push(&mut args, &["-r", &fps.to_string()]);
    if profile.backend != Backend::Vaapi {
        push(&mut args, &["-s", &size]);
    }

    if spec.audio_enabled {
        match spec.audio_codec.to_lowercase().as_str() {
            "pcm_alaw" => push(&mut args, &["-c:a", "pcm_alaw", "-ar", "8000", "-ac", "1"]),
            _ => push(
                &mut args,
                &["-c:a", "aac", "-b:a", "128k", "-ar", "44100", "-ac", "2"],
            ),
        }
    } else {
        args.push("-an".to_string());
    }

    push(
        &mut args,
        &["-f", "rtsp", "-rtsp_transport", "tcp", "-rtsp_flags", "prefer_tcp"],
    );
    args.push(ctx.rtsp_url(&spec.name));

    Invocation {
        program,
        args,
        input_slot,
        hosted_source,
    }
}
