// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 单路视频流处理流水线 (Per-stream processing pipeline)
///
/// 两种流水线:
/// - Traffic: 双通道检测融合 (追踪通道 + 展示通道) + 标定测速 + 区域过滤
/// - Flood:   单通道场景分类
///
/// 流水线由 Hub 在阻塞线程中调用, 同一路流的帧严格串行。
pub mod annotate;
pub mod flood;
pub mod fusion;

use std::sync::Arc;

use image::{codecs::jpeg::JpegEncoder, RgbImage};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::ModelProvider;
use crate::protocol::Handshake;

pub use annotate::Annotator;
pub use flood::{label_is_flood, FloodPipeline};
pub use fusion::{DetectionFusionEngine, SessionSummary, StreamSetup};

// ========== 帧级指标 ==========

/// 交通流指标
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficMetrics {
    pub current_count: usize,
    /// km/h, 保留一位小数
    pub current_avg_speed: f32,
}

/// 洪水分类指标
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodMetrics {
    pub is_flood: bool,
    pub score: f32,
    pub frames_processed: u64,
}

/// 每帧输出的指标 (ack 与广播信封共用)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameMetrics {
    Traffic(TrafficMetrics),
    Flood(FloodMetrics),
}

impl FrameMetrics {
    pub fn as_traffic(&self) -> Option<&TrafficMetrics> {
        match self {
            FrameMetrics::Traffic(m) => Some(m),
            FrameMetrics::Flood(_) => None,
        }
    }
}

// ========== 流水线接口 ==========

pub trait StreamPipeline: Send {
    /// 握手后初始化 (标定、区域、模型); 失败时流水线保持未初始化
    fn init_stream(
        &mut self,
        handshake: &Handshake,
        models: &dyn ModelProvider,
    ) -> Result<(), PipelineError>;

    /// 处理一帧, 返回 (标注后图像, 指标)
    fn process_frame(&mut self, frame: &RgbImage) -> Result<(RgbImage, FrameMetrics), PipelineError>;

    fn is_ready(&self) -> bool;

    /// 会话汇总 (JSON)
    fn summary(&self) -> serde_json::Value;
}

/// 流水线类型 (每个 Hub 实例固定一种)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Traffic,
    Flood,
}

impl PipelineKind {
    pub fn build(
        &self,
        config: Arc<PipelineConfig>,
        annotator: Arc<Annotator>,
    ) -> Box<dyn StreamPipeline> {
        match self {
            PipelineKind::Traffic => Box::new(DetectionFusionEngine::new(config, annotator)),
            PipelineKind::Flood => Box::new(FloodPipeline::new(config, annotator)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineKind::Traffic => "traffic",
            PipelineKind::Flood => "flood",
        }
    }
}

/// RGB → JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;
    Ok(buf)
}

/// 四舍五入到一位小数
pub(crate) fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_serialize_flat() {
        let traffic = FrameMetrics::Traffic(TrafficMetrics {
            current_count: 2,
            current_avg_speed: 31.5,
        });
        let json = serde_json::to_value(&traffic).unwrap();
        assert_eq!(json, serde_json::json!({"current_count": 2, "current_avg_speed": 31.5}));

        let flood: FrameMetrics =
            serde_json::from_str(r#"{"is_flood":true,"score":0.5,"frames_processed":3}"#).unwrap();
        assert!(matches!(flood, FrameMetrics::Flood(ref m) if m.is_flood && m.frames_processed == 3));
        assert!(flood.as_traffic().is_none());
    }

    #[test]
    fn jpeg_encoding() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn rounding() {
        assert_eq!(round1(3.6000001), 3.6);
        assert_eq!(round1(12.34), 12.3);
        assert_eq!(round1(0.0), 0.0);
    }
}
