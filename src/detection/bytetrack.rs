// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! ByteTrack 算法实现
//! ByteTrack: Simple and effective multi-object tracking
//!
//! 核心思想:
//! 1. 高低分检测框分开处理
//! 2. 高分框优先与所有轨迹匹配 (预测框 IOU)
//! 3. 低分框救援未匹配的轨迹 (遮挡时置信度下降)
//! 4. 纯运动模型, 轨迹在遮挡期间靠预测维持
//!
//! 与原版不同, 所有未匹配的检测框都会新建轨迹, 以满足
//! `IdentityTracker` "每个输入框一个身份" 的约定。

use super::tracker::{compute_iou, IdentityTracker};
use super::types::BBox;

/// ByteTrack 参数
#[derive(Clone, Debug)]
pub struct ByteTrackParams {
    /// 最大允许丢失帧数
    pub max_lost_frames: u32,
    /// 高分检测阈值
    pub high_score_threshold: f32,
    /// 低分检测阈值 (低于此值的框只在新建轨迹时使用)
    pub low_score_threshold: f32,
    /// 高分匹配 IOU 阈值
    pub high_iou_threshold: f32,
    /// 低分匹配 IOU 阈值
    pub low_iou_threshold: f32,
}

impl Default for ByteTrackParams {
    fn default() -> Self {
        Self {
            max_lost_frames: 60,
            high_score_threshold: 0.4,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.4,
            low_iou_threshold: 0.3,
        }
    }
}

// ========== 运动模型 ==========

/// 匀速运动模型 (cx, cy, w, h 及其速度), 标量增益的简化卡尔曼平滑
#[derive(Clone, Debug)]
struct MotionState {
    pos: [f32; 4],
    vel: [f32; 4],
    /// 位置不确定度, 预测时增长, 观测时收缩
    uncertainty: f32,
}

impl MotionState {
    const PROCESS_NOISE: f32 = 0.1;
    const OBS_NOISE: f32 = 0.5;
    const VELOCITY_DECAY: f32 = 0.95;

    fn from_bbox(bbox: &BBox) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            pos: [cx, cy, bbox.width(), bbox.height()],
            vel: [0.0; 4],
            uncertainty: 10.0,
        }
    }

    fn predict(&mut self) {
        for i in 0..4 {
            self.vel[i] *= Self::VELOCITY_DECAY;
            self.pos[i] += self.vel[i];
        }
        self.pos[2] = self.pos[2].max(1.0);
        self.pos[3] = self.pos[3].max(1.0);
        self.uncertainty += Self::PROCESS_NOISE;
    }

    fn correct(&mut self, bbox: &BBox) {
        let obs = Self::from_bbox(bbox).pos;
        let gain = self.uncertainty / (self.uncertainty + Self::OBS_NOISE);
        for i in 0..4 {
            let residual = obs[i] - self.pos[i];
            self.pos[i] += gain * residual;
            // 速度只吸收部分残差, 避免单帧抖动
            self.vel[i] += 0.5 * gain * residual;
        }
        self.uncertainty *= 1.0 - gain;
    }

    fn bbox(&self, template: &BBox) -> BBox {
        let [cx, cy, w, h] = self.pos;
        BBox {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
            ..template.clone()
        }
    }
}

/// ByteTrack 跟踪轨迹
#[derive(Clone, Debug)]
struct ByteTrack {
    id: u32,
    /// 最近一次观测 (保留类别与置信度)
    last_obs: BBox,
    motion: MotionState,
    frames_lost: u32,
}

impl ByteTrack {
    fn new(id: u32, bbox: &BBox) -> Self {
        Self {
            id,
            last_obs: bbox.clone(),
            motion: MotionState::from_bbox(bbox),
            frames_lost: 0,
        }
    }

    fn predicted_bbox(&self) -> BBox {
        self.motion.bbox(&self.last_obs)
    }

    fn update(&mut self, bbox: &BBox) {
        self.motion.correct(bbox);
        self.last_obs = bbox.clone();
        self.frames_lost = 0;
    }
}

/// ByteTrack 追踪器
pub struct ByteTracker {
    tracks: Vec<ByteTrack>,
    next_id: u32,
    params: ByteTrackParams,
}

impl ByteTracker {
    pub fn new(params: ByteTrackParams) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            params,
        }
    }

    /// IOU 贪心匹配: 按 1-IOU 代价升序分配, 返回 (检测索引, 轨迹索引)
    fn match_detections(
        &self,
        detections: &[(usize, &BBox)],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        let mut candidates = Vec::new();
        for (local_det, (det_idx, det)) in detections.iter().enumerate() {
            for (local_track, &track_idx) in track_indices.iter().enumerate() {
                let iou = compute_iou(det, &self.tracks[track_idx].predicted_bbox());
                if iou >= iou_threshold {
                    candidates.push((1.0 - iou, *det_idx, local_det, track_idx, local_track));
                }
            }
        }

        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_det = vec![false; detections.len()];
        let mut used_track = vec![false; track_indices.len()];
        let mut assignments = Vec::new();
        for (_, det_idx, local_det, track_idx, local_track) in candidates {
            if !used_det[local_det] && !used_track[local_track] {
                used_det[local_det] = true;
                used_track[local_track] = true;
                assignments.push((det_idx, track_idx));
            }
        }
        assignments
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new(ByteTrackParams::default())
    }
}

impl IdentityTracker for ByteTracker {
    fn update(&mut self, boxes: &[BBox]) -> Vec<u32> {
        // 1. 所有轨迹先预测
        for track in &mut self.tracks {
            track.motion.predict();
        }

        // 2. 分离高低分检测框
        let (high, low): (Vec<(usize, &BBox)>, Vec<(usize, &BBox)>) = boxes
            .iter()
            .enumerate()
            .filter(|(_, b)| b.confidence >= self.params.low_score_threshold)
            .partition(|(_, b)| b.confidence >= self.params.high_score_threshold);

        let mut ids: Vec<Option<u32>> = vec![None; boxes.len()];
        let mut matched_track = vec![false; self.tracks.len()];

        // 3. 第一轮: 高分检测 + 所有轨迹
        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        for (det_idx, track_idx) in
            self.match_detections(&high, &all_tracks, self.params.high_iou_threshold)
        {
            self.tracks[track_idx].update(&boxes[det_idx]);
            ids[det_idx] = Some(self.tracks[track_idx].id);
            matched_track[track_idx] = true;
        }

        // 4. 第二轮: 低分检测 + 未匹配轨迹 (救援)
        let remaining: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| !matched_track[i])
            .collect();
        for (det_idx, track_idx) in
            self.match_detections(&low, &remaining, self.params.low_iou_threshold)
        {
            self.tracks[track_idx].update(&boxes[det_idx]);
            ids[det_idx] = Some(self.tracks[track_idx].id);
            matched_track[track_idx] = true;
        }

        // 5. 未匹配轨迹 → 丢失计数, 超时删除
        for (track, matched) in self.tracks.iter_mut().zip(matched_track.iter()) {
            if !matched {
                track.frames_lost += 1;
            }
        }
        let max_lost = self.params.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        // 6. 未匹配检测 → 新建轨迹
        boxes
            .iter()
            .zip(ids)
            .map(|(bbox, id)| {
                id.unwrap_or_else(|| {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(ByteTrack::new(id, bbox));
                    id
                })
            })
            .collect()
    }

    fn reset(&mut self) {
        self.tracks.clear();
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn active_ids(&self) -> Vec<u32> {
        self.tracks.iter().map(|t| t.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, conf: f32) -> BBox {
        BBox::new(x, 100.0, x + 60.0, 140.0, conf, 2)
    }

    #[test]
    fn steady_motion_keeps_identity() {
        let mut tracker = ByteTracker::default();
        let id = tracker.update(&[bbox(0.0, 0.9)])[0];
        for step in 1..30 {
            let ids = tracker.update(&[bbox(step as f32 * 5.0, 0.9)]);
            assert_eq!(ids, vec![id], "lost identity at step {}", step);
        }
    }

    #[test]
    fn low_score_box_rescues_track() {
        let mut tracker = ByteTracker::default();
        let id = tracker.update(&[bbox(0.0, 0.9)])[0];
        tracker.update(&[bbox(5.0, 0.9)]);
        // 遮挡: 置信度降到高分阈值以下
        let ids = tracker.update(&[bbox(10.0, 0.2)]);
        assert_eq!(ids, vec![id]);
    }

    #[test]
    fn identity_survives_short_occlusion() {
        let mut tracker = ByteTracker::default();
        let id = tracker.update(&[bbox(0.0, 0.9)])[0];
        for _ in 0..10 {
            tracker.update(&[]);
        }
        assert_eq!(tracker.update(&[bbox(0.0, 0.9)]), vec![id]);
    }

    #[test]
    fn retired_after_max_lost() {
        let mut tracker = ByteTracker::new(ByteTrackParams {
            max_lost_frames: 3,
            ..Default::default()
        });
        let id = tracker.update(&[bbox(0.0, 0.9)])[0];
        for _ in 0..4 {
            tracker.update(&[]);
        }
        assert_eq!(tracker.track_count(), 0);
        assert_ne!(tracker.update(&[bbox(0.0, 0.9)])[0], id);
    }

    #[test]
    fn every_box_gets_an_identity() {
        let mut tracker = ByteTracker::default();
        let ids = tracker.update(&[bbox(0.0, 0.9), bbox(300.0, 0.05), bbox(600.0, 0.2)]);
        assert_eq!(ids.len(), 3);
        assert_eq!(tracker.active_ids().len(), 3);
    }
}
