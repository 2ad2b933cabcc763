// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 单路流会话: 流水线 + 最新帧 + 持有的遥测指标

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::HubError;
use crate::lock_unpoisoned;
use crate::pipeline::{encode_jpeg, FrameMetrics, StreamPipeline};
use crate::protocol::decode_frame_payload;

/// 一帧处理结果
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub jpeg: Bytes,
    pub metrics: FrameMetrics,
}

pub struct StreamSession {
    stream_id: String,
    created_at: DateTime<Utc>,
    producer_attached: AtomicBool,
    pipeline: Mutex<Option<Box<dyn StreamPipeline>>>,
    address: Mutex<Option<Value>>,
    latest_frame: Mutex<Option<Bytes>>,
    held_metrics: Mutex<Option<FrameMetrics>>,
    frames_processed: AtomicU64,
}

impl StreamSession {
    pub fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            created_at: Utc::now(),
            producer_attached: AtomicBool::new(false),
            pipeline: Mutex::new(None),
            address: Mutex::new(None),
            latest_frame: Mutex::new(None),
            held_metrics: Mutex::new(None),
            frames_processed: AtomicU64::new(0),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// 占用生产者位; 已有生产者时返回 false
    pub(crate) fn try_attach_producer(&self) -> bool {
        self.producer_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_producer(&self) -> bool {
        self.producer_attached.load(Ordering::Acquire)
    }

    pub(crate) fn install(&self, pipeline: Box<dyn StreamPipeline>, address: Option<Value>) {
        *lock_unpoisoned(&self.pipeline) = Some(pipeline);
        *lock_unpoisoned(&self.address) = address;
        *lock_unpoisoned(&self.held_metrics) = None;
    }

    /// 生产者断开: 释放流水线, 会话回到空闲
    pub(crate) fn detach_producer(&self) {
        lock_unpoisoned(&self.pipeline).take();
        lock_unpoisoned(&self.held_metrics).take();
        self.producer_attached.store(false, Ordering::Release);
    }

    pub fn address(&self) -> Option<Value> {
        lock_unpoisoned(&self.address).clone()
    }

    pub(crate) fn hold_metrics(&self, metrics: FrameMetrics) {
        *lock_unpoisoned(&self.held_metrics) = Some(metrics);
    }

    /// 最近一次遥测推送时的指标 (广播信封使用)
    pub fn held_metrics(&self) -> Option<FrameMetrics> {
        lock_unpoisoned(&self.held_metrics).clone()
    }

    pub fn latest_frame(&self) -> Option<Bytes> {
        lock_unpoisoned(&self.latest_frame).clone()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// 解码 → 流水线 → JPEG 编码 (阻塞, 在 spawn_blocking 中调用)
    pub(crate) fn process_payload(
        &self,
        payload: &[u8],
        jpeg_quality: u8,
    ) -> Result<ProcessedFrame, HubError> {
        let bytes = decode_frame_payload(payload);
        let image = image::load_from_memory(&bytes)
            .map_err(|e| HubError::FrameDecode(e.to_string()))?
            .to_rgb8();

        let (annotated, metrics) = {
            let mut guard = lock_unpoisoned(&self.pipeline);
            let pipeline = guard
                .as_mut()
                .ok_or_else(|| HubError::FrameProcess("stream not initialized".to_string()))?;
            pipeline.process_frame(&image)?
        };

        let jpeg = Bytes::from(encode_jpeg(&annotated, jpeg_quality)?);
        *lock_unpoisoned(&self.latest_frame) = Some(jpeg.clone());
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        Ok(ProcessedFrame { jpeg, metrics })
    }

    /// 会话汇总 JSON
    pub fn summary(&self) -> Value {
        let pipeline = lock_unpoisoned(&self.pipeline)
            .as_ref()
            .map(|p| p.summary());
        json!({
            "stream_id": self.stream_id,
            "active": self.has_producer(),
            "created_at": self.created_at.to_rfc3339(),
            "frames_processed": self.frames_processed(),
            "summary": pipeline,
        })
    }
}
