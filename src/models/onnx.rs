// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 包含: 模型加载、预处理 (左上角对齐 letterbox)、推理、后处理

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array, Array4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::{
    non_max_suppression, softmax, Classification, Classifier, Detector, ModelProvider,
};
use crate::detection::{types::INF_SIZE, BBox};

const CXYWH_OFFSET: usize = 4;
const NMS_IOU: f32 = 0.45;
const PAD_VALUE: f32 = 144.0 / 255.0;

fn build_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)
        .with_context(|| format!("failed to load model {}", path.display()))?;
    Ok(session)
}

fn input_name(session: &Session) -> Result<String> {
    session
        .inputs
        .first()
        .map(|i| i.name.clone())
        .ok_or_else(|| anyhow!("model has no inputs"))
}

/// YOLOv8 风格检测器 (输出 [1, 4+nc, N])
pub struct OnnxDetector {
    session: Session,
    input: String,
    size: u32,
}

impl OnnxDetector {
    pub fn new(path: &Path) -> Result<Self> {
        tracing::info!("📦 加载检测模型: {}", path.display());
        let session = build_session(path)?;
        let input = input_name(&session)?;
        Ok(Self {
            session,
            input,
            size: INF_SIZE,
        })
    }

    /// 等比缩放后放在左上角, 其余区域填充灰色; 返回 (张量, 缩放比)
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, f32) {
        let (w0, h0) = image.dimensions();
        let ratio = (self.size as f32 / w0 as f32).min(self.size as f32 / h0 as f32);
        let w_new = ((w0 as f32 * ratio).round() as u32).clamp(1, self.size);
        let h_new = ((h0 as f32 * ratio).round() as u32).clamp(1, self.size);
        let resized = image::imageops::resize(image, w_new, h_new, FilterType::Triangle);

        let side = self.size as usize;
        let mut input = Array::from_elem((1, 3, side, side), PAD_VALUE);
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = rgb.0;
            input[[0, 0, y, x]] = r as f32 / 255.0;
            input[[0, 1, y, x]] = g as f32 / 255.0;
            input[[0, 2, y, x]] = b as f32 / 255.0;
        }
        (input, ratio)
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, image: &RgbImage, conf: f32) -> Result<Vec<BBox>> {
        let (input, ratio) = self.preprocess(image);
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input.as_str() => tensor])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        if dims.len() != 3 || dims[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected detector output shape {:?}", dims));
        }
        let (channels, anchors) = (dims[1], dims[2]);
        let nc = channels - CXYWH_OFFSET;
        let (w0, h0) = (image.width() as f32, image.height() as f32);

        let mut boxes = Vec::new();
        for i in 0..anchors {
            let at = |c: usize| data[c * anchors + i];

            let (class_id, confidence) = (0..nc)
                .map(|c| (c, at(CXYWH_OFFSET + c)))
                .fold((0, f32::MIN), |best, x| if x.1 > best.1 { x } else { best });
            if confidence < conf {
                continue;
            }

            let cx = at(0) / ratio;
            let cy = at(1) / ratio;
            let w = at(2) / ratio;
            let h = at(3) / ratio;
            boxes.push(BBox::new(
                (cx - w / 2.0).clamp(0.0, w0),
                (cy - h / 2.0).clamp(0.0, h0),
                (cx + w / 2.0).clamp(0.0, w0),
                (cy + h / 2.0).clamp(0.0, h0),
                confidence,
                class_id as u32,
            ));
        }

        non_max_suppression(&mut boxes, NMS_IOU);
        Ok(boxes)
    }
}

/// 图像分类器 (输出 [1, nc])
pub struct OnnxClassifier {
    session: Session,
    input: String,
    labels: Vec<String>,
    size: u32,
}

impl OnnxClassifier {
    pub fn new(path: &Path, labels: Vec<String>) -> Result<Self> {
        tracing::info!("📦 加载分类模型: {}", path.display());
        let session = build_session(path)?;
        let input = input_name(&session)?;
        Ok(Self {
            session,
            input,
            labels,
            size: 224,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&mut self, image: &RgbImage, top_k: usize) -> Result<Vec<Classification>> {
        let resized = image::imageops::resize(image, self.size, self.size, FilterType::Triangle);
        let side = self.size as usize;
        let mut input = Array::zeros((1, 3, side, side));
        for (x, y, rgb) in resized.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = rgb.0[c] as f32 / 255.0;
            }
        }

        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input.as_str() => tensor])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;

        // 已是概率分布时不再做 softmax
        let sum: f32 = data.iter().sum();
        let probs = if data.iter().all(|&p| (0.0..=1.0).contains(&p)) && (sum - 1.0).abs() < 1e-3
        {
            data.to_vec()
        } else {
            softmax(data)
        };

        let mut ranked: Vec<Classification> = probs
            .iter()
            .enumerate()
            .map(|(i, &score)| Classification {
                label: self
                    .labels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", i)),
                score,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(top_k.max(1));
        Ok(ranked)
    }
}

/// 基于文件路径的模型工厂
#[derive(Debug, Clone)]
pub struct OnnxModels {
    pub tracked: PathBuf,
    pub display: PathBuf,
    pub flood: PathBuf,
    pub flood_labels: Vec<String>,
}

impl ModelProvider for OnnxModels {
    fn tracked_detector(&self, weights: Option<&str>) -> Result<Box<dyn Detector>> {
        let path = weights.map(PathBuf::from).unwrap_or_else(|| self.tracked.clone());
        Ok(Box::new(OnnxDetector::new(&path)?))
    }

    fn display_detector(&self) -> Result<Box<dyn Detector>> {
        Ok(Box::new(OnnxDetector::new(&self.display)?))
    }

    fn flood_classifier(&self) -> Result<Box<dyn Classifier>> {
        Ok(Box::new(OnnxClassifier::new(
            &self.flood,
            self.flood_labels.clone(),
        )?))
    }
}
