// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 模型统一接口
//!
//! # 架构说明
//!
//! 检测/分类模型是不透明的能力:
//! - **Detector**:   给定图像, 返回 检测框 + 类别 + 置信度
//! - **Classifier**: 给定图像, 返回 标签 + 置信度 (按置信度降序)
//!
//! `ModelProvider` 按流创建模型实例, 由 Hub 在构造时注入。
//! ONNX Runtime 实现位于 `onnx` 模块 (cargo feature `onnx`)。

use anyhow::{bail, Result};
use image::RgbImage;

use crate::detection::{compute_iou, BBox};

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxClassifier, OnnxDetector, OnnxModels};

/// 检测模型接口
pub trait Detector: Send {
    /// `conf` 是最低置信度提示; 调用方仍会再次过滤
    fn detect(&mut self, image: &RgbImage, conf: f32) -> Result<Vec<BBox>>;
}

/// 分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub score: f32,
}

/// 分类模型接口
pub trait Classifier: Send {
    /// 返回 top-k 结果, 置信度降序
    fn classify(&mut self, image: &RgbImage, top_k: usize) -> Result<Vec<Classification>>;
}

/// 模型工厂 (每路流独立的模型实例)
pub trait ModelProvider: Send + Sync {
    /// 追踪通道检测器; `weights` 为握手中指定的权重
    fn tracked_detector(&self, weights: Option<&str>) -> Result<Box<dyn Detector>>;

    /// 展示通道检测器
    fn display_detector(&self) -> Result<Box<dyn Detector>>;

    /// 洪水场景分类器
    fn flood_classifier(&self) -> Result<Box<dyn Classifier>>;
}

/// 未编译推理后端时使用: 所有流初始化都会失败 (close 1011)
#[derive(Debug, Default, Clone)]
pub struct UnavailableModels;

impl ModelProvider for UnavailableModels {
    fn tracked_detector(&self, _weights: Option<&str>) -> Result<Box<dyn Detector>> {
        bail!("no inference backend compiled in (enable the `onnx` feature)")
    }

    fn display_detector(&self) -> Result<Box<dyn Detector>> {
        bail!("no inference backend compiled in (enable the `onnx` feature)")
    }

    fn flood_classifier(&self) -> Result<Box<dyn Classifier>> {
        bail!("no inference backend compiled in (enable the `onnx` feature)")
    }
}

/// 按类别的非极大值抑制 (class-aware NMS)
pub fn non_max_suppression(boxes: &mut Vec<BBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..boxes.len() {
        let drop = boxes[..kept].iter().any(|prev| {
            prev.class_id == boxes[index].class_id && compute_iou(prev, &boxes[index]) > iou_threshold
        });
        if !drop {
            boxes.swap(kept, index);
            kept += 1;
        }
    }
    boxes.truncate(kept);
}

/// softmax (分类输出未归一化时使用)
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}
