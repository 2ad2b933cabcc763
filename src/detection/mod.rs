// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 检测与跟踪 (Detection & Tracking)
///
/// - types:     检测框 / 身份 / 检测结果
/// - tracker:   身份追踪接口 + 贪心IOU追踪器
/// - bytetrack: ByteTrack 追踪器 (遮挡容忍)
/// - speed:     基于世界坐标轨迹的速度估计
pub mod bytetrack;
pub mod speed;
pub mod tracker;
pub mod types;

pub use bytetrack::{ByteTrackParams, ByteTracker};
pub use speed::{SpeedEstimator, MPS_TO_KPH};
pub use tracker::{compute_iou, id_to_color, IdentityTracker, SimpleTracker};
pub use types::{BBox, Detection, Identity, TrackerKind};
