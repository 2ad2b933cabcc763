// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 多目标跟踪公共组件
//! Identity tracking: the tracker interface plus the greedy IoU tracker.

use super::types::BBox;

// ========== 跟踪器统一接口 ==========

/// 身份追踪器 Trait
///
/// 所有跟踪算法 (Simple, ByteTrack) 都实现此接口, 融合引擎只依赖它。
pub trait IdentityTracker: Send {
    /// 更新跟踪器
    ///
    /// # 返回
    /// 与 `boxes` 等长、同序的身份ID
    fn update(&mut self, boxes: &[BBox]) -> Vec<u32>;

    /// 重置跟踪器 (清除所有跟踪)
    fn reset(&mut self);

    /// 获取当前跟踪数量 (含丢失宽限期内的轨迹)
    fn track_count(&self) -> usize;

    /// 当前仍存活的身份ID
    fn active_ids(&self) -> Vec<u32>;
}

// ========== 贪心 IOU 跟踪器 ==========

#[derive(Clone, Debug)]
struct SimpleTrack {
    id: u32,
    bbox: BBox,
    frames_lost: u32,
}

/// 贪心最大重叠跟踪器
///
/// 按轨迹创建顺序遍历, 每条轨迹取尚未分配的检测框中 IOU 最大者;
/// IOU ≥ 阈值则匹配。未匹配的检测框分配新ID, 未匹配的轨迹丢失计数 +1,
/// 超过 `max_lost` 后删除。非全局最优, 单帧延迟下可接受。
#[derive(Clone, Debug)]
pub struct SimpleTracker {
    tracks: Vec<SimpleTrack>,
    next_id: u32,
    iou_threshold: f32,
    max_lost: u32,
}

impl SimpleTracker {
    pub fn new(iou_threshold: f32, max_lost: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            iou_threshold,
            max_lost,
        }
    }
}

impl Default for SimpleTracker {
    fn default() -> Self {
        Self::new(0.3, 5)
    }
}

impl IdentityTracker for SimpleTracker {
    fn update(&mut self, boxes: &[BBox]) -> Vec<u32> {
        let mut assigned: Vec<Option<u32>> = vec![None; boxes.len()];
        let mut matched_track = vec![false; self.tracks.len()];

        // 1. 已有轨迹按顺序贪心匹配
        for (t_idx, track) in self.tracks.iter_mut().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (j, bbox) in boxes.iter().enumerate() {
                if assigned[j].is_some() {
                    continue;
                }
                let iou = compute_iou(&track.bbox, bbox);
                if iou > best.map_or(0.0, |(_, b)| b) {
                    best = Some((j, iou));
                }
            }

            if let Some((j, iou)) = best {
                if iou >= self.iou_threshold {
                    assigned[j] = Some(track.id);
                    track.bbox = boxes[j].clone();
                    track.frames_lost = 0;
                    matched_track[t_idx] = true;
                }
            }
        }

        // 2. 未匹配的轨迹 → 标记丢失 (新建轨迹之前处理)
        for (track, matched) in self.tracks.iter_mut().zip(matched_track.iter()) {
            if !matched {
                track.frames_lost += 1;
            }
        }
        let max_lost = self.max_lost;
        self.tracks.retain(|t| t.frames_lost <= max_lost);

        // 3. 未匹配的检测框 → 新建轨迹
        boxes
            .iter()
            .zip(assigned)
            .map(|(bbox, id)| match id {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(SimpleTrack {
                        id,
                        bbox: bbox.clone(),
                        frames_lost: 0,
                    });
                    id
                }
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

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1 = bbox1.x1.max(bbox2.x1);
    let y1 = bbox1.y1.max(bbox2.y1);
    let x2 = bbox1.x2.min(bbox2.x2);
    let y2 = bbox1.y2.min(bbox2.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// 根据ID生成不同颜色
pub fn id_to_color(id: u32) -> [u8; 3] {
    let hue = (id as f32 * 137.508) % 360.0; // 黄金角度采样
    hsv_to_rgb(hue, 0.8, 0.9)
}

/// HSV转RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    [
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32) -> BBox {
        BBox::new(x, y, x + 40.0, y + 20.0, 0.9, 2)
    }

    #[test]
    fn iou_basics() {
        let a = bbox(0.0, 0.0);
        assert!((compute_iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(compute_iou(&a, &bbox(100.0, 100.0)), 0.0);
        // 半重叠: 交 20x20=400, 并 800+800-400=1200
        assert!((compute_iou(&a, &bbox(20.0, 0.0)) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn identity_persists_while_overlapping() {
        let mut tracker = SimpleTracker::new(0.3, 5);
        let mut first = None;
        for step in 0..20 {
            let ids = tracker.update(&[bbox(step as f32 * 4.0, 10.0)]);
            assert_eq!(ids.len(), 1);
            match first {
                None => first = Some(ids[0]),
                Some(id) => assert_eq!(ids[0], id, "identity changed at step {}", step),
            }
        }
        assert_eq!(tracker.track_count(), 1);
    }

    #[test]
    fn output_matches_input_order() {
        let mut tracker = SimpleTracker::default();
        let ids = tracker.update(&[bbox(0.0, 0.0), bbox(200.0, 0.0), bbox(400.0, 0.0)]);
        assert_eq!(ids, vec![0, 1, 2]);

        // 顺序打乱后仍返回对应身份
        let ids = tracker.update(&[bbox(402.0, 0.0), bbox(1.0, 0.0), bbox(199.0, 0.0)]);
        assert_eq!(ids, vec![2, 0, 1]);
    }

    #[test]
    fn lost_track_survives_grace_period() {
        let mut tracker = SimpleTracker::new(0.3, 5);
        let id = tracker.update(&[bbox(50.0, 50.0)])[0];
        for _ in 0..5 {
            assert!(tracker.update(&[]).is_empty());
        }
        assert_eq!(tracker.update(&[bbox(50.0, 50.0)]), vec![id]);
    }

    #[test]
    fn new_identity_after_max_lost_exceeded() {
        let mut tracker = SimpleTracker::new(0.3, 5);
        let id = tracker.update(&[bbox(50.0, 50.0)])[0];
        for _ in 0..6 {
            tracker.update(&[]);
        }
        assert_eq!(tracker.track_count(), 0);
        let new_id = tracker.update(&[bbox(50.0, 50.0)])[0];
        assert_ne!(new_id, id);
    }

    #[test]
    fn low_overlap_spawns_new_identity() {
        let mut tracker = SimpleTracker::new(0.3, 5);
        let a = tracker.update(&[bbox(0.0, 0.0)])[0];
        // IOU = 1/3 ≥ 0.3 → 匹配
        assert_eq!(tracker.update(&[bbox(20.0, 0.0)])[0], a);
        // 再移动 30 像素: 交 10x20=200, 并 1400 → 0.14 < 0.3
        let b = tracker.update(&[bbox(50.0, 0.0)])[0];
        assert_ne!(a, b);
        assert_eq!(tracker.active_ids(), vec![a, b]);
    }

    #[test]
    fn colors_differ_between_ids() {
        assert_ne!(id_to_color(1), id_to_color(2));
    }
}
