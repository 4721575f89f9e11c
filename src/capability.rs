use crate::config::ServerConfig;
use crate::error::CapabilityError;
use crate::stream::VideoCodec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const VAAPI_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 编码器的具体实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Nvenc,
    Vaapi,
    Software,
}

impl Backend {
    /// 硬件优先，软件兜底
    pub const PREFERENCE: [Backend; 3] = [Backend::Nvenc, Backend::Vaapi, Backend::Software];

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Backend::Software)
    }

    pub fn accel_label(&self) -> &'static str {
        match self {
            Backend::Nvenc => "nvenc",
            Backend::Vaapi => "vaapi",
            Backend::Software => "cpu",
        }
    }
}

/// 编解码器与后端组合对应的编码器名
pub fn encoder_name(codec: VideoCodec, backend: Backend) -> Option<&'static str> {
    match (codec, backend) {
        (VideoCodec::H264, Backend::Software) => Some("libx264"),
        (VideoCodec::H265, Backend::Software) => Some("libx265"),
        (VideoCodec::Mpeg4, Backend::Software) => Some("mpeg4"),
        (VideoCodec::H264, Backend::Nvenc) => Some("h264_nvenc"),
        (VideoCodec::H265, Backend::Nvenc) => Some("hevc_nvenc"),
        (VideoCodec::H264, Backend::Vaapi) => Some("h264_vaapi"),
        (VideoCodec::H265, Backend::Vaapi) => Some("hevc_vaapi"),
        _ => None,
    }
}

/// 启动时选定的编码组合
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncoderProfile {
    pub codec: VideoCodec,
    pub backend: Backend,
    pub encoder: String,
}

impl EncoderProfile {
    pub fn new(codec: VideoCodec, backend: Backend) -> Option<Self> {
        encoder_name(codec, backend).map(|encoder| Self {
            codec,
            backend,
            encoder: encoder.to_string(),
        })
    }
}

/// 从主机收集的原始信息，随后归并为 [`Capabilities`]
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub encoders: HashSet<String>,
    pub nvidia_gpu: bool,
    pub vaapi_usable: HashSet<VideoCodec>,
}

/// 每种编解码器按优先级排列的可用后端
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    available: BTreeMap<VideoCodec, Vec<Backend>>,
}

impl Capabilities {
    pub fn from_inventory(inventory: &Inventory, hardware_allowed: bool) -> Self {
        let mut available = BTreeMap::new();

        for codec in [VideoCodec::H264, VideoCodec::H265, VideoCodec::Mpeg4] {
            let backends: Vec<Backend> = Backend::PREFERENCE
                .iter()
                .copied()
                .filter(|backend| {
                    let Some(name) = encoder_name(codec, *backend) else {
                        return false;
                    };
                    if !inventory.encoders.contains(name) {
                        return false;
                    }
                    match backend {
                        Backend::Software => true,
                        Backend::Nvenc => hardware_allowed && inventory.nvidia_gpu,
                        Backend::Vaapi => {
                            hardware_allowed && inventory.vaapi_usable.contains(&codec)
                        }
                    }
                })
                .collect();

            if !backends.is_empty() {
                available.insert(codec, backends);
            }
        }

        Self { available }
    }

    /// 固定能力集
    pub fn from_backends(entries: impl IntoIterator<Item = (VideoCodec, Vec<Backend>)>) -> Self {
        Self {
            available: entries.into_iter().collect(),
        }
    }

    pub fn query(&self, codec: VideoCodec) -> &[Backend] {
        self.available
            .get(&codec)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn codecs(&self) -> impl Iterator<Item = VideoCodec> + '_ {
        self.available.keys().copied()
    }

    /// 按硬件偏好选第一个可用后端，否则回退到软件
    pub fn select_backend(
        &self,
        codec: VideoCodec,
        prefer_hardware: bool,
    ) -> Result<EncoderProfile, CapabilityError> {
        let options = self.query(codec);
        let chosen = if prefer_hardware {
            options.first().copied()
        } else {
            options.iter().copied().find(|b| !b.is_hardware())
        };

        chosen
            .and_then(|backend| EncoderProfile::new(codec, backend))
            .ok_or_else(|| CapabilityError::NoEncoderAvailable(codec.to_string()))
    }
}

/// 解析 `-encoders` 输出，每行第二个字段为编码器名
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// 编码器检测。转码器的编码器列表只查询一次，硬件路径再结合主机确认
/// (GPU 是否存在，render node 设备做一次短时编码测试)，结果缓存到进程退出
pub struct EncoderDiscovery {
    transcoder: String,
    render_node: PathBuf,
    hardware_allowed: bool,
    cache: OnceCell<Capabilities>,
}

impl EncoderDiscovery {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            transcoder: server.transcoder_binary.clone(),
            render_node: PathBuf::from(&server.render_node),
            hardware_allowed: server.hardware_accel,
            cache: OnceCell::new(),
        }
    }

    /// 使用已知的能力集，跳过主机检测
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            transcoder: String::new(),
            render_node: PathBuf::new(),
            hardware_allowed: true,
            cache: OnceCell::new_with(Some(capabilities)),
        }
    }

    pub async fn capabilities(&self) -> &Capabilities {
        self.cache.get_or_init(|| self.discover()).await
    }

    pub async fn query(&self, codec: VideoCodec) -> Vec<Backend> {
        self.capabilities().await.query(codec).to_vec()
    }

    pub async fn select_backend(
        &self,
        codec: VideoCodec,
        prefer_hardware: bool,
    ) -> Result<EncoderProfile, CapabilityError> {
        self.capabilities()
            .await
            .select_backend(codec, prefer_hardware)
    }

    async fn discover(&self) -> Capabilities {
        if which::which(&self.transcoder).is_err() {
            warn!(
                "Transcoder '{}' not found in PATH; no encoders available",
                self.transcoder
            );
            return Capabilities::default();
        }

        let mut inventory = Inventory {
            encoders: self.list_encoders().await,
            ..Default::default()
        };

        if self.hardware_allowed {
            inventory.nvidia_gpu = nvidia_gpu_present().await;
            if self.render_node.exists() {
                for codec in [VideoCodec::H264, VideoCodec::H265] {
                    let Some(name) = encoder_name(codec, Backend::Vaapi) else {
                        continue;
                    };
                    if inventory.encoders.contains(name) && self.test_vaapi_encode(name).await {
                        inventory.vaapi_usable.insert(codec);
                    }
                }
            }
        }

        let capabilities = Capabilities::from_inventory(&inventory, self.hardware_allowed);
        info!(
            "Encoder capabilities: {}",
            serde_json::to_string(&capabilities).unwrap_or_default()
        );
        capabilities
    }

    async fn list_encoders(&self) -> HashSet<String> {
        let output = Command::new(&self.transcoder)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                parse_encoder_list(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                warn!("'{} -encoders' exited with {}", self.transcoder, out.status);
                HashSet::new()
            }
            Err(e) => {
                warn!("Failed to query transcoder encoders: {}", e);
                HashSet::new()
            }
        }
    }

    /// render node 设备仅声明支持还不够，须通过一次合成编码
    async fn test_vaapi_encode(&self, encoder: &str) -> bool {
        let node = self.render_node.to_string_lossy().to_string();
        let child = Command::new(&self.transcoder)
            .args(["-loglevel", "error", "-vaapi_device", &node])
            .args(["-f", "lavfi", "-i", "testsrc=duration=0.1:size=320x240:rate=10"])
            .args(["-vf", "format=nv12,hwupload", "-c:v", encoder, "-qp", "23"])
            .args(["-t", "0.1", "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(VAAPI_TEST_TIMEOUT, child).await {
            Ok(Ok(status)) => {
                debug!("VAAPI test encode with {} exited {}", encoder, status);
                status.success()
            }
            Ok(Err(e)) => {
                debug!("VAAPI test encode with {} failed to run: {}", encoder, e);
                false
            }
            Err(_) => {
                warn!("VAAPI test encode with {} timed out", encoder);
                false
            }
        }
    }
}

async fn nvidia_gpu_present() -> bool {
    if which::which("nvidia-smi").is_err() {
        return false;
    }
    match Command::new("nvidia-smi")
        .args(["--query-gpu=gpu_name", "--format=csv,noheader"])
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(out) => out.status.success() && !String::from_utf8_lossy(&out.stdout).trim().is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS_OUTPUT: &str = "\
Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D h264_vaapi           H.264/AVC (VAAPI) (codec h264)
 V....D hevc_vaapi           H.265/HEVC (VAAPI) (codec hevc)
 V....D mpeg4                MPEG-4 part 2
 A....D aac                  AAC (Advanced Audio Coding)
";

    fn inventory() -> Inventory {
        Inventory {
            encoders: parse_encoder_list(ENCODERS_OUTPUT),
            nvidia_gpu: true,
            vaapi_usable: [VideoCodec::H264].into_iter().collect(),
        }
    }

    #[test]
    fn encoder_list_matches_second_token() {
        let encoders = parse_encoder_list(ENCODERS_OUTPUT);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("h264_nvenc"));
        assert!(!encoders.contains("libx265"));
        // 描述文字不会被当成编码器名
        assert!(!encoders.contains("NVIDIA"));
    }

    #[test]
    fn preference_order_is_nvenc_vaapi_software() {
        let caps = Capabilities::from_inventory(&inventory(), true);
        assert_eq!(
            caps.query(VideoCodec::H264),
            &[Backend::Nvenc, Backend::Vaapi, Backend::Software]
        );
        // hevc_vaapi 已声明但编码测试失败
        assert!(caps.query(VideoCodec::H265).is_empty());
        assert_eq!(caps.query(VideoCodec::Mpeg4), &[Backend::Software]);
    }

    #[test]
    fn hardware_disabled_leaves_software_only() {
        let caps = Capabilities::from_inventory(&inventory(), false);
        assert_eq!(caps.query(VideoCodec::H264), &[Backend::Software]);
    }

    #[test]
    fn select_backend_honors_preference_and_falls_back() {
        let caps = Capabilities::from_inventory(&inventory(), true);

        let hw = caps.select_backend(VideoCodec::H264, true).unwrap();
        assert_eq!(hw.backend, Backend::Nvenc);
        assert_eq!(hw.encoder, "h264_nvenc");

        let sw = caps.select_backend(VideoCodec::H264, false).unwrap();
        assert_eq!(sw.backend, Backend::Software);
        assert_eq!(sw.encoder, "libx264");

        let mpeg4 = caps.select_backend(VideoCodec::Mpeg4, true).unwrap();
        assert_eq!(mpeg4.backend, Backend::Software);
    }

    #[test]
    fn select_backend_fails_when_nothing_matches() {
        let caps = Capabilities::from_backends([(VideoCodec::H265, vec![Backend::Nvenc])]);

        assert_eq!(
            caps.select_backend(VideoCodec::H264, true),
            Err(CapabilityError::NoEncoderAvailable("h264".to_string()))
        );
        // 只有硬件实现的编解码器，偏好软件
        assert!(caps.select_backend(VideoCodec::H265, false).is_err());
    }

    #[tokio::test]
    async fn seeded_capabilities_skip_host_checks() {
        let discovery = EncoderDiscovery::with_capabilities(Capabilities::from_backends([(
            VideoCodec::H264,
            vec![Backend::Software],
        )]));
        assert_eq!(discovery.query(VideoCodec::H264).await, vec![Backend::Software]);
        assert!(discovery.query(VideoCodec::H265).await.is_empty());
    }
}
