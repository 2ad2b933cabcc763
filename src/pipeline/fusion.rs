// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 双通道检测融合引擎 (Detection Fusion Engine)
//!
//! 每帧两次推理:
//! 1. 追踪通道: 轻量检测器 → 类别/置信度/区域过滤 → 追踪器分配身份 → 标定测速
//! 2. 展示通道: 高精度检测器 → 同样过滤, 不追踪
//! 3. 融合: 每个展示框取 IOU 最大的追踪框, IOU ≥ `fusion_iou` 时继承其身份与速度,
//!    否则分配合成身份 (展示框序号), 速度为 0
//!
//! 检测器出错时本帧降级: 返回原图 + 零指标, 不中断会话。

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;
use serde_json::json;

use super::{round1, Annotator, FrameMetrics, StreamPipeline, TrafficMetrics};
use crate::config::PipelineConfig;
use crate::detection::{
    compute_iou, BBox, ByteTracker, Detection, Identity, IdentityTracker, SimpleTracker,
    SpeedEstimator, TrackerKind,
};
use crate::error::PipelineError;
use crate::geometry::{Anchor, Calibrator, Point, ZoneFilter};
use crate::models::{Detector, ModelProvider};
use crate::protocol::Handshake;

/// 由握手 + 默认配置解析出的单路流参数
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSetup {
    pub image_pts: Vec<Point>,
    pub world_pts: Vec<Point>,
    pub zone: Vec<Point>,
    pub classes: Vec<u32>,
    pub conf: f32,
    pub tracker: TrackerKind,
    pub weights: Option<String>,
    pub fps: f32,
}

impl StreamSetup {
    pub fn from_handshake(handshake: &Handshake, config: &PipelineConfig) -> Self {
        Self {
            image_pts: handshake.image_pts.clone(),
            world_pts: handshake.world_pts.clone(),
            zone: handshake
                .zone_pts
                .clone()
                .unwrap_or_else(|| handshake.image_pts.clone()),
            classes: handshake
                .classes
                .clone()
                .unwrap_or_else(|| config.default_classes.clone()),
            conf: handshake.conf.unwrap_or(config.default_conf),
            tracker: TrackerKind::from_cfg(handshake.tracker_cfg.as_deref()),
            weights: handshake.model_weights.clone(),
            fps: handshake.fps.unwrap_or(30.0),
        }
    }
}

/// 会话累计统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub frames_processed: u64,
    pub total_tracked_vehicles: usize,
    pub vehicle_counts_by_class: BTreeMap<String, usize>,
    pub average_speed_kmh: f32,
    pub all_speeds: Vec<f32>,
}

#[derive(Debug, Default)]
struct SummaryState {
    frames: u64,
    seen_ids: HashSet<u32>,
    max_per_class: BTreeMap<String, usize>,
    speed_sum: f64,
    speed_samples: u64,
    recent_speeds: VecDeque<f32>,
}

impl SummaryState {
    fn record_speed(&mut self, speed: f32, keep: usize) {
        self.speed_sum += speed as f64;
        self.speed_samples += 1;
        self.recent_speeds.push_back(speed);
        while self.recent_speeds.len() > keep {
            self.recent_speeds.pop_front();
        }
    }

    fn snapshot(&self) -> SessionSummary {
        let average = if self.speed_samples > 0 {
            (self.speed_sum / self.speed_samples as f64) as f32
        } else {
            0.0
        };
        SessionSummary {
            frames_processed: self.frames,
            total_tracked_vehicles: self.seen_ids.len(),
            vehicle_counts_by_class: self.max_per_class.clone(),
            average_speed_kmh: round1(average),
            all_speeds: self.recent_speeds.iter().copied().collect(),
        }
    }
}

/// 初始化后的流状态
struct Ready {
    setup: StreamSetup,
    calibrator: Calibrator,
    zone: ZoneFilter,
    tracker: Box<dyn IdentityTracker>,
    speeds: SpeedEstimator,
    tracked_model: Box<dyn Detector>,
    display_model: Box<dyn Detector>,
}

pub struct DetectionFusionEngine {
    config: Arc<PipelineConfig>,
    annotator: Arc<Annotator>,
    state: Option<Ready>,
    summary: SummaryState,
}

impl DetectionFusionEngine {
    pub fn new(config: Arc<PipelineConfig>, annotator: Arc<Annotator>) -> Self {
        Self {
            config,
            annotator,
            state: None,
            summary: SummaryState::default(),
        }
    }

    /// 使用已构造的模型初始化 (标定失败时保持未初始化)
    pub fn init_with_models(
        &mut self,
        setup: StreamSetup,
        tracked_model: Box<dyn Detector>,
        display_model: Box<dyn Detector>,
    ) -> Result<(), PipelineError> {
        let mut calibrator = Calibrator::new();
        calibrator.calibrate(&setup.image_pts, &setup.world_pts)?;

        let zone = ZoneFilter::new(setup.zone.clone(), self.config.zone_anchors.clone());
        if !zone.is_valid() {
            tracing::warn!("⚠️  区域多边形无效, 所有检测将被过滤: {:?}", setup.zone);
        }

        let tracker: Box<dyn IdentityTracker> = match setup.tracker {
            TrackerKind::Simple => Box::new(SimpleTracker::new(
                self.config.tracker_iou,
                self.config.tracker_max_lost,
            )),
            TrackerKind::ByteTrack => Box::new(ByteTracker::new(self.config.bytetrack_params())),
        };

        // 轨迹长度 = 1 秒
        let trace_length = setup.fps.round().max(2.0) as usize;
        let speeds = SpeedEstimator::new(trace_length, setup.fps, self.config.speed_unit);

        tracing::debug!(
            tracker = ?setup.tracker,
            fps = setup.fps,
            conf = setup.conf,
            classes = ?setup.classes,
            "fusion engine initialized"
        );

        self.state = Some(Ready {
            setup,
            calibrator,
            zone,
            tracker,
            speeds,
            tracked_model,
            display_model,
        });
        self.summary = SummaryState::default();
        Ok(())
    }

    pub fn setup(&self) -> Option<&StreamSetup> {
        self.state.as_ref().map(|s| &s.setup)
    }

    pub fn session_summary(&self) -> SessionSummary {
        self.summary.snapshot()
    }
}

/// 类别/置信度过滤 + 区域过滤
fn filter_boxes(boxes: Vec<BBox>, setup: &StreamSetup, zone: &ZoneFilter) -> Vec<BBox> {
    let kept: Vec<BBox> = boxes
        .into_iter()
        .filter(|b| b.confidence >= setup.conf && setup.classes.contains(&b.class_id))
        .collect();
    zone.retain(kept, |b| b)
}

/// 展示框继承追踪身份; 并列时取先出现的追踪框
pub fn fuse(tracked: &[Detection], display: Vec<BBox>, min_iou: f32) -> Vec<Detection> {
    display
        .into_iter()
        .enumerate()
        .map(|(index, bbox)| {
            let mut best: Option<(&Detection, f32)> = None;
            for candidate in tracked {
                let iou = compute_iou(&bbox, &candidate.bbox);
                if best.map_or(true, |(_, b)| iou > b) {
                    best = Some((candidate, iou));
                }
            }
            match best {
                Some((src, iou)) if iou >= min_iou => Detection {
                    bbox,
                    identity: src.identity,
                    speed: src.speed,
                },
                _ => Detection {
                    bbox,
                    identity: Some(Identity::Synthetic(index)),
                    speed: 0.0,
                },
            }
        })
        .collect()
}

fn zero_metrics() -> FrameMetrics {
    FrameMetrics::Traffic(TrafficMetrics::default())
}

impl StreamPipeline for DetectionFusionEngine {
    fn init_stream(
        &mut self,
        handshake: &Handshake,
        models: &dyn ModelProvider,
    ) -> Result<(), PipelineError> {
        let setup = StreamSetup::from_handshake(handshake, &self.config);
        // 先验证标定, 避免无意义地加载模型
        Calibrator::new().calibrate(&setup.image_pts, &setup.world_pts)?;
        let tracked = models
            .tracked_detector(setup.weights.as_deref())
            .map_err(|e| PipelineError::Init(format!("tracked detector: {:#}", e)))?;
        let display = models
            .display_detector()
            .map_err(|e| PipelineError::Init(format!("display detector: {:#}", e)))?;
        self.init_with_models(setup, tracked, display)
    }

    fn process_frame(&mut self, frame: &RgbImage) -> Result<(RgbImage, FrameMetrics), PipelineError> {
        let config = self.config.clone();
        let state = self.state.as_mut().ok_or(PipelineError::NotInitialized)?;
        self.summary.frames += 1;

        // === 1. 追踪通道 ===
        let raw = match state.tracked_model.detect(frame, state.setup.conf) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!("⚠️  追踪通道推理失败, 本帧降级: {:#}", e);
                return Ok((frame.clone(), zero_metrics()));
            }
        };
        let tracked_boxes = filter_boxes(raw, &state.setup, &state.zone);
        let ids = state.tracker.update(&tracked_boxes);

        let mut tracked = Vec::with_capacity(tracked_boxes.len());
        for (bbox, id) in tracked_boxes.into_iter().zip(ids) {
            let anchor = Anchor::Center.of(&bbox);
            match state.calibrator.map_to_world(&[anchor]) {
                Ok(world) => state.speeds.update_trajectory(id, world[0]),
                Err(e) => tracing::debug!(id, "world mapping failed: {}", e),
            }
            let speed = state.speeds.current_speed(id);
            self.summary.seen_ids.insert(id);
            if speed > 0.0 {
                self.summary.record_speed(speed, config.speed_history);
            }
            tracked.push(Detection {
                bbox,
                identity: Some(Identity::Tracked(id)),
                speed,
            });
        }
        state.speeds.retain(&state.tracker.active_ids());

        // === 2. 展示通道 ===
        let raw = match state.display_model.detect(frame, state.setup.conf) {
            Ok(boxes) => boxes,
            Err(e) => {
                tracing::warn!("⚠️  展示通道推理失败, 本帧降级: {:#}", e);
                return Ok((frame.clone(), zero_metrics()));
            }
        };
        let display_boxes = filter_boxes(raw, &state.setup, &state.zone);

        // === 3. 融合 ===
        let fused = fuse(&tracked, display_boxes, config.fusion_iou);

        // === 4. 指标 ===
        // 平均速度只统计追踪通道中速度为正的身份, 与展示通道的匹配结果无关
        let speeds: Vec<f32> = tracked.iter().map(|d| d.speed).filter(|&s| s > 0.0).collect();
        let avg = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f32>() / speeds.len() as f32
        };
        let metrics = TrafficMetrics {
            current_count: fused.len(),
            current_avg_speed: round1(avg),
        };

        let mut per_class: BTreeMap<String, usize> = BTreeMap::new();
        for det in &fused {
            *per_class.entry(config.class_name(det.class_id())).or_default() += 1;
        }
        for (name, count) in per_class {
            let max = self.summary.max_per_class.entry(name).or_default();
            *max = (*max).max(count);
        }

        // === 5. 标注 ===
        let mut annotated = frame.clone();
        let zone_polygon = state.zone.polygon().to_vec();
        self.annotator.draw_zone(&mut annotated, &zone_polygon);
        for det in &fused {
            let label = super::annotate::detection_label(det, &config.class_name(det.class_id()));
            self.annotator.draw_detection(&mut annotated, det, &label);
        }

        Ok((annotated, FrameMetrics::Traffic(metrics)))
    }

    fn is_ready(&self) -> bool {
        self.state.is_some()
    }

    fn summary(&self) -> serde_json::Value {
        let snapshot = self.summary.snapshot();
        serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}))
    }
}
