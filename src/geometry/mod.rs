// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 几何模块 (Geometry)
///
/// - Calibrator:  图像 ↔ 世界坐标透视标定
/// - ZoneFilter:  感兴趣区域过滤
pub mod homography;
pub mod zone;

pub use homography::{CalibrationTransform, Calibrator, Homography, Point};
pub use zone::{point_in_polygon, Anchor, ZoneFilter};
