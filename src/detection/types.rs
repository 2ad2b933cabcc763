// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测系统数据结构定义
/// Data structures shared by detectors, trackers and the fusion engine
use std::fmt;

use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// 检测模型推理输入尺寸
pub const INF_SIZE: u32 = 640;

// ========== 枚举类型 ==========

/// 追踪器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    Simple,
    ByteTrack,
}

impl TrackerKind {
    /// 根据握手中的 tracker_cfg 选择追踪器 (如 "bytetrack.yaml")
    pub fn from_cfg(cfg: Option<&str>) -> Self {
        match cfg {
            Some(name) if name.to_ascii_lowercase().contains("bytetrack") => TrackerKind::ByteTrack,
            _ => TrackerKind::Simple,
        }
    }
}

/// 目标身份: 追踪器分配的ID, 或融合时未匹配的展示框序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    Tracked(u32),
    Synthetic(usize),
}

impl Identity {
    pub fn tracked(&self) -> Option<u32> {
        match self {
            Identity::Tracked(id) => Some(*id),
            Identity::Synthetic(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Tracked(id) => write!(f, "#{}", id),
            Identity::Synthetic(idx) => write!(f, "#{}", idx),
        }
    }
}

// ========== 数据结构 ==========

/// 检测框 (Detection bounding box), 像素坐标
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// 平移 (测试与模拟推流使用)
    pub fn shifted(&self, dx: f32, dy: f32) -> Self {
        Self {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
            ..self.clone()
        }
    }
}

/// 单帧单目标检测结果
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    /// 追踪帧中由追踪器分配, 展示帧中通过融合继承
    pub identity: Option<Identity>,
    /// 当前速度 (km/h), 未测速时为 0
    pub speed: f32,
}

impl Detection {
    pub fn new(bbox: BBox) -> Self {
        Self {
            bbox,
            identity: None,
            speed: 0.0,
        }
    }

    pub fn class_id(&self) -> u32 {
        self.bbox.class_id
    }
}

impl From<BBox> for Detection {
    fn from(bbox: BBox) -> Self {
        Self::new(bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_kind_from_cfg() {
        assert_eq!(TrackerKind::from_cfg(Some("bytetrack.yaml")), TrackerKind::ByteTrack);
        assert_eq!(TrackerKind::from_cfg(Some("ByteTrack")), TrackerKind::ByteTrack);
        assert_eq!(TrackerKind::from_cfg(Some("simple")), TrackerKind::Simple);
        assert_eq!(TrackerKind::from_cfg(None), TrackerKind::Simple);
    }

    #[test]
    fn synthetic_identity_has_no_tracked_id() {
        assert_eq!(Identity::Tracked(7).tracked(), Some(7));
        assert_eq!(Identity::Synthetic(2).tracked(), None);
    }
}
