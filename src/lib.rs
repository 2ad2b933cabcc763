// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 服务参数 + 流水线调参
pub mod detection; // 检测数据结构、追踪器、测速
pub mod error; // 错误类型
pub mod geometry; // 标定 (单应性) 与区域过滤
pub mod hub; // 会话管理与广播
pub mod models; // 模型接口与推理后端
pub mod pipeline; // 融合引擎 / 洪水分类 / 标注
pub mod protocol; // 连接协议
pub mod server; // axum 路由
pub mod telemetry; // NGSI-LD 遥测

use std::sync::{Mutex, MutexGuard};

pub use crate::config::{Args, PipelineConfig};
pub use crate::error::{HubError, PipelineError};
pub use crate::hub::{HubDeps, StreamHub};
pub use crate::pipeline::{FrameMetrics, PipelineKind, StreamPipeline};
pub use crate::server::{router, AppState};

/// 获取锁; 持锁线程 panic 后仍继续使用内部数据
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

