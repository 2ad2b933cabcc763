// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 配置 - 命令行参数 + JSON 调参文件

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::detection::ByteTrackParams;
use crate::geometry::Anchor;

/// 流分析服务参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "智慧城市视频流分析中心 / sensor-stream analytics hub", long_about = None)]
pub struct Args {
    /// 监听地址
    #[arg(long, env = "SENSORHUB_BIND", default_value = "0.0.0.0:8000")]
    pub bind: SocketAddr,

    /// Orion-LD 上下文代理地址; 不设置时遥测只写日志
    #[arg(long, env = "ORION_URL")]
    pub orion_url: Option<String>,

    /// NGSI-LD 租户
    #[arg(long, env = "FIWARE_SERVICE", default_value = "openiot")]
    pub fiware_service: String,

    #[arg(long, env = "FIWARE_SERVICE_PATH", default_value = "/")]
    pub fiware_service_path: String,

    /// 遥测推送最小间隔 (秒)
    #[arg(long, default_value_t = 5)]
    pub telemetry_interval_secs: u64,

    /// 流水线调参文件 (不存在时自动生成)
    #[arg(long, default_value = "sensorhub.json")]
    pub config: PathBuf,

    /// 追踪检测模型 (低分辨率, 与追踪器配合)
    #[arg(long, default_value = "models/yolov8n.onnx")]
    pub tracked_model: PathBuf,

    /// 展示检测模型 (高精度, 不追踪)
    #[arg(long, default_value = "models/yolov8m.onnx")]
    pub display_model: PathBuf,

    /// 洪水分类模型
    #[arg(long, default_value = "models/flood_cls.onnx")]
    pub flood_model: PathBuf,

    /// 标注字体 (TTF); 不设置时只画框不写字
    #[arg(long, env = "SENSORHUB_FONT")]
    pub font: Option<PathBuf>,

    /// 每个订阅者的发送队列长度
    #[arg(long, default_value_t = 32)]
    pub consumer_buffer: usize,
}

impl Args {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }
}

/// 流水线参数配置 (JSON)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 融合 / 追踪 ===
    pub fusion_iou: f32,       // 展示框继承身份的最小IOU
    pub tracker_iou: f32,      // 贪心追踪器匹配阈值
    pub tracker_max_lost: u32, // 贪心追踪器最大丢失帧数

    // === ByteTrack ===
    pub bytetrack_max_lost_frames: u32,
    pub bytetrack_high_score_threshold: f32,
    pub bytetrack_low_score_threshold: f32,
    pub bytetrack_high_iou_threshold: f32,
    pub bytetrack_low_iou_threshold: f32,

    // === 测速 ===
    pub speed_unit: f32,      // 世界单位/秒 → 输出单位
    pub speed_history: usize, // 会话保留的速度样本数

    // === 检测默认值 ===
    pub default_conf: f32,
    pub default_classes: Vec<u32>,
    pub class_names: Vec<String>,
    pub zone_anchors: Vec<Anchor>,
    pub flood_labels: Vec<String>, // 洪水分类模型输出标签

    // === 输出 ===
    pub jpeg_quality: u8,
    pub zone_fill_alpha: f32,

    // === 连接 ===
    pub handshake_timeout_secs: f32, // 握手等待 (秒, 可为小数)
    pub subscribe_timeout_secs: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fusion_iou: 0.3,
            tracker_iou: 0.3,
            tracker_max_lost: 5,

            bytetrack_max_lost_frames: 60,
            bytetrack_high_score_threshold: 0.4,
            bytetrack_low_score_threshold: 0.1,
            bytetrack_high_iou_threshold: 0.4,
            bytetrack_low_iou_threshold: 0.3,

            speed_unit: crate::detection::MPS_TO_KPH,
            speed_history: 100,

            default_conf: 0.35,
            default_classes: vec![2, 3, 5, 7],
            class_names: [
                "person",
                "bicycle",
                "car",
                "motorcycle",
                "airplane",
                "bus",
                "train",
                "truck",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            zone_anchors: vec![Anchor::TopCenter, Anchor::BottomCenter],
            flood_labels: vec!["Flooded Scene".to_string(), "Non Flooded".to_string()],

            jpeg_quality: 80,
            zone_fill_alpha: 0.2,

            handshake_timeout_secs: 10.0,
            subscribe_timeout_secs: 5.0,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置; 文件不存在时写入默认配置, 解析失败时使用默认值
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    tracing::info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("📝 配置文件不存在, 创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    tracing::error!("❌ 保存配置失败: {}", e);
                } else {
                    tracing::info!("💾 配置已保存到 {}", path.display());
                }
            }
            Err(e) => tracing::error!("❌ 序列化配置失败: {}", e),
        }
    }

    pub fn bytetrack_params(&self) -> ByteTrackParams {
        ByteTrackParams {
            max_lost_frames: self.bytetrack_max_lost_frames,
            high_score_threshold: self.bytetrack_high_score_threshold,
            low_score_threshold: self.bytetrack_low_score_threshold,
            high_iou_threshold: self.bytetrack_high_iou_threshold,
            low_iou_threshold: self.bytetrack_low_iou_threshold,
        }
    }

    /// 类别名; 超出表范围时回退为 "class_<id>"
    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }

    pub fn handshake_timeout(&self) -> Duration {
        secs_or(self.handshake_timeout_secs, 10.0)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        secs_or(self.subscribe_timeout_secs, 5.0)
    }
}

/// 负数 / NaN 的配置值回退为默认秒数
fn secs_or(secs: f32, fallback: f32) -> Duration {
    Duration::try_from_secs_f32(secs).unwrap_or_else(|_| Duration::from_secs_f32(fallback))
}
