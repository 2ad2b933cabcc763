// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 区域过滤 (Zone Filter)
//! Point-in-polygon test evaluated at fixed anchors of each detection box.

use serde::{Deserialize, Serialize};

use super::homography::Point;
use crate::detection::types::BBox;

/// 检测框锚点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    TopCenter,
    BottomCenter,
    Center,
    TopLeft,
    BottomRight,
}

impl Anchor {
    pub fn of(&self, bbox: &BBox) -> Point {
        let cx = (bbox.x1 + bbox.x2) / 2.0;
        let cy = (bbox.y1 + bbox.y2) / 2.0;
        match self {
            Anchor::TopCenter => [cx, bbox.y1],
            Anchor::BottomCenter => [cx, bbox.y2],
            Anchor::Center => [cx, cy],
            Anchor::TopLeft => [bbox.x1, bbox.y1],
            Anchor::BottomRight => [bbox.x2, bbox.y2],
        }
    }
}

/// 多边形区域过滤器; 所有锚点都在多边形内 (含边界) 才算在区域内
#[derive(Debug, Clone)]
pub struct ZoneFilter {
    polygon: Vec<Point>,
    anchors: Vec<Anchor>,
    valid: bool,
}

impl ZoneFilter {
    pub fn new(polygon: Vec<Point>, anchors: Vec<Anchor>) -> Self {
        let valid = polygon.len() >= 3
            && !anchors.is_empty()
            && polygon.iter().all(|p| p[0].is_finite() && p[1].is_finite())
            && polygon_area(&polygon).abs() > f32::EPSILON;
        Self {
            polygon,
            anchors,
            valid,
        }
    }

    /// 多边形是否可用 (畸形多边形会拒绝所有检测)
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn polygon(&self) -> &[Point] {
        &self.polygon
    }

    pub fn inside(&self, bbox: &BBox) -> bool {
        self.valid
            && self
                .anchors
                .iter()
                .all(|a| point_in_polygon(a.of(bbox), &self.polygon))
    }

    /// 只保留区域内的元素
    pub fn retain<T>(&self, items: Vec<T>, bbox_of: impl Fn(&T) -> &BBox) -> Vec<T> {
        items.into_iter().filter(|it| self.inside(bbox_of(it))).collect()
    }
}

fn polygon_area(polygon: &[Point]) -> f32 {
    let n = polygon.len();
    (0..n)
        .map(|i| {
            let a = polygon[i];
            let b = polygon[(i + 1) % n];
            a[0] * b[1] - b[0] * a[1]
        })
        .sum::<f32>()
        / 2.0
}

/// 射线法判断点是否在多边形内; 边上的点视为在内
pub fn point_in_polygon(p: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (polygon[i], polygon[j]);
        if on_segment(p, a, b) {
            return true;
        }
        if (a[1] > p[1]) != (b[1] > p[1]) {
            let x_cross = (b[0] - a[0]) * (p[1] - a[1]) / (b[1] - a[1]) + a[0];
            if p[0] < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
    if cross.abs() > 1e-3 {
        return false;
    }
    p[0] >= a[0].min(b[0]) - 1e-3
        && p[0] <= a[0].max(b[0]) + 1e-3
        && p[1] >= a[1].min(b[1]) - 1e-3
        && p[1] <= a[1].max(b[1]) + 1e-3
}
