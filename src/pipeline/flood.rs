// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 洪水场景分类流水线
//! Single-pass scene classifier: top-1 label decides `is_flood`, banner drawn top-left.

use std::sync::Arc;

use image::RgbImage;
use serde_json::json;

use super::{Annotator, FloodMetrics, FrameMetrics, StreamPipeline};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{Classifier, ModelProvider};
use crate::protocol::Handshake;

const TOP_K: usize = 3;

/// 标签是否表示洪水; "Non Flooded" / "not flood" 等否定形式不算
pub fn label_is_flood(label: &str) -> bool {
    let lower = label.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().enumerate().any(|(i, w)| {
        let negated = i > 0 && matches!(words[i - 1], "non" | "no" | "not");
        w.starts_with("flood") && !negated
    })
}

pub struct FloodPipeline {
    annotator: Arc<Annotator>,
    classifier: Option<Box<dyn Classifier>>,
    fps: f32,
    frames_processed: u64,
    flood_frames: u64,
    last: FloodMetrics,
}

impl FloodPipeline {
    pub fn new(_config: Arc<PipelineConfig>, annotator: Arc<Annotator>) -> Self {
        Self {
            annotator,
            classifier: None,
            fps: 1.0,
            frames_processed: 0,
            flood_frames: 0,
            last: FloodMetrics::default(),
        }
    }

    pub fn init_with_classifier(&mut self, classifier: Box<dyn Classifier>, fps: f32) {
        self.classifier = Some(classifier);
        self.fps = fps;
        self.frames_processed = 0;
        self.flood_frames = 0;
        self.last = FloodMetrics::default();
    }
}

impl StreamPipeline for FloodPipeline {
    fn init_stream(
        &mut self,
        handshake: &Handshake,
        models: &dyn ModelProvider,
    ) -> Result<(), PipelineError> {
        let classifier = models
            .flood_classifier()
            .map_err(|e| PipelineError::Init(format!("flood classifier: {:#}", e)))?;
        self.init_with_classifier(classifier, handshake.fps.unwrap_or(1.0));
        Ok(())
    }

    fn process_frame(&mut self, frame: &RgbImage) -> Result<(RgbImage, FrameMetrics), PipelineError> {
        let classifier = self.classifier.as_mut().ok_or(PipelineError::NotInitialized)?;

        let (is_flood, score) = match classifier.classify(frame, TOP_K) {
            Ok(ranked) => ranked
                .first()
                .map(|top| (label_is_flood(&top.label), top.score))
                .unwrap_or((false, 0.0)),
            Err(e) => {
                tracing::warn!("⚠️  洪水分类失败, 本帧按无洪水处理: {:#}", e);
                (false, 0.0)
            }
        };

        self.frames_processed += 1;
        if is_flood {
            self.flood_frames += 1;
        }
        self.last = FloodMetrics {
            is_flood,
            score,
            frames_processed: self.frames_processed,
        };

        let mut annotated = frame.clone();
        self.annotator.draw_flood_banner(&mut annotated, is_flood, score);
        Ok((annotated, FrameMetrics::Flood(self.last.clone())))
    }

    fn is_ready(&self) -> bool {
        self.classifier.is_some()
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "frames_processed": self.frames_processed,
            "flood_frames": self.flood_frames,
            "fps": self.fps,
            "last": self.last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Classification;
    use anyhow::{anyhow, Result};

    struct Fixed(Vec<Classification>);

    impl Classifier for Fixed {
        fn classify(&mut self, _image: &RgbImage, top_k: usize) -> Result<Vec<Classification>> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }
    }

    struct Broken;

    impl Classifier for Broken {
        fn classify(&mut self, _image: &RgbImage, _top_k: usize) -> Result<Vec<Classification>> {
            Err(anyhow!("corrupt tensor"))
        }
    }

    fn pipeline() -> FloodPipeline {
        FloodPipeline::new(
            Arc::new(PipelineConfig::default()),
            Arc::new(Annotator::new(None, 0.2)),
        )
    }

    fn flood(metrics: FrameMetrics) -> FloodMetrics {
        match metrics {
            FrameMetrics::Flood(m) => m,
            other => panic!("unexpected metrics {:?}", other),
        }
    }

    #[test]
    fn labels() {
        assert!(label_is_flood("Flooded Scene"));
        assert!(label_is_flood("flood"));
        assert!(!label_is_flood("Non Flooded"));
        assert!(!label_is_flood("non-flooded"));
        assert!(!label_is_flood("not flood"));
        assert!(!label_is_flood("dry road"));
    }

    #[test]
    fn top1_decides_and_counts_frames() {
        let mut p = pipeline();
        assert!(matches!(
            p.process_frame(&RgbImage::new(8, 8)),
            Err(PipelineError::NotInitialized)
        ));

        p.init_with_classifier(
            Box::new(Fixed(vec![
                Classification {
                    label: "Flooded Scene".into(),
                    score: 0.91,
                },
                Classification {
                    label: "Non Flooded".into(),
                    score: 0.09,
                },
            ])),
            1.0,
        );
        let frame = RgbImage::from_pixel(400, 60, image::Rgb([200, 200, 200]));
        let (out, metrics) = p.process_frame(&frame).unwrap();
        let m = flood(metrics);
        assert!(m.is_flood);
        assert_eq!(m.score, 0.91);
        assert_eq!(m.frames_processed, 1);
        // 横幅背景
        assert_eq!(out.get_pixel(200, 20).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(200, 45).0, [200, 200, 200]);

        let (_, metrics) = p.process_frame(&frame).unwrap();
        assert_eq!(flood(metrics).frames_processed, 2);
        assert_eq!(p.summary()["flood_frames"], 2);
    }

    #[test]
    fn classifier_error_reports_no_flood() {
        let mut p = pipeline();
        p.init_with_classifier(Box::new(Broken), 1.0);
        let (_, metrics) = p.process_frame(&RgbImage::new(8, 8)).unwrap();
        let m = flood(metrics);
        assert!(!m.is_flood);
        assert_eq!(m.score, 0.0);
        assert_eq!(m.frames_processed, 1);
    }
}
