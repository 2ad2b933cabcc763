// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 流分析中心 (Stream Hub)
///
/// # 架构说明
///
/// ```text
/// producer ──handshake──▶ open_producer ──▶ StreamSession (pipeline)
///          ──frame──────▶ ProducerHandle::handle_frame
///                            ├─ spawn_blocking: decode → pipeline → JPEG
///                            ├─ ack ──────────▶ producer
///                            ├─ telemetry (限速) ─▶ Orion
///                            └─ broadcast ─────▶ 订阅该流的 consumer + 全局 consumer
/// ```
///
/// - 会话表与订阅表各用一把锁; 广播时先在锁内收集接收者, 锁外不做 IO
/// - 每个 consumer 一个有界队列; 队列满时丢弃该 consumer 的本帧, 队列关闭时移除 consumer
/// - 同一路流同时只允许一个 producer
pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{HubError, Result};
use crate::lock_unpoisoned;
use crate::models::ModelProvider;
use crate::pipeline::{Annotator, PipelineKind};
use crate::protocol::{encode_envelope, Ack, FrameMeta, Handshake};
use crate::telemetry::TelemetryPublisher;

pub use session::{ProcessedFrame, StreamSession};

pub type ConsumerId = Uuid;

/// 构造 Hub 所需的共享依赖
#[derive(Clone)]
pub struct HubDeps {
    pub config: Arc<PipelineConfig>,
    pub annotator: Arc<Annotator>,
    pub models: Arc<dyn ModelProvider>,
    pub telemetry: TelemetryPublisher,
    pub consumer_buffer: usize,
}

#[derive(Default)]
struct Subscribers {
    senders: HashMap<ConsumerId, mpsc::Sender<Bytes>>,
    scopes: HashMap<ConsumerId, Option<String>>,
    by_stream: HashMap<String, HashSet<ConsumerId>>,
    global: HashSet<ConsumerId>,
}

impl Subscribers {
    fn detach(&mut self, id: &ConsumerId) -> Option<String> {
        match self.scopes.remove(id).flatten() {
            Some(stream_id) => {
                if let Some(set) = self.by_stream.get_mut(&stream_id) {
                    set.remove(id);
                    if set.is_empty() {
                        self.by_stream.remove(&stream_id);
                    }
                }
                Some(stream_id)
            }
            None => {
                self.global.remove(id);
                None
            }
        }
    }

    fn attach(&mut self, id: ConsumerId, scope: Option<String>) {
        match &scope {
            Some(stream_id) => {
                self.by_stream.entry(stream_id.clone()).or_default().insert(id);
            }
            None => {
                self.global.insert(id);
            }
        }
        self.scopes.insert(id, scope);
    }

    fn remove(&mut self, id: &ConsumerId) -> Option<String> {
        self.senders.remove(id);
        self.detach(id)
    }
}

struct HubInner {
    kind: PipelineKind,
    deps: HubDeps,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
    subscribers: Mutex<Subscribers>,
}

#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

/// 已注册的订阅者: ID + 接收队列
pub struct ConsumerHandle {
    pub id: ConsumerId,
    pub rx: mpsc::Receiver<Bytes>,
}

impl StreamHub {
    /// 每个 Hub 持有独立的遥测窗口表, 同名流在不同 Hub 间互不影响
    pub fn new(kind: PipelineKind, mut deps: HubDeps) -> Self {
        deps.telemetry = deps.telemetry.with_own_windows();
        Self {
            inner: Arc::new(HubInner {
                kind,
                deps,
                sessions: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Subscribers::default()),
            }),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.inner.kind
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.deps.config
    }

    // ========== 会话 ==========

    fn get_or_create_session(&self, stream_id: &str) -> Arc<StreamSession> {
        lock_unpoisoned(&self.inner.sessions)
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(stream_id, "session created");
                Arc::new(StreamSession::new(stream_id))
            })
            .clone()
    }

    pub fn session(&self, stream_id: &str) -> Option<Arc<StreamSession>> {
        lock_unpoisoned(&self.inner.sessions).get(stream_id).cloned()
    }

    /// 有 producer 在线的流 (排序)
    pub fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_unpoisoned(&self.inner.sessions)
            .values()
            .filter(|s| s.has_producer())
            .map(|s| s.stream_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// 无 producer 且无订阅者的空闲会话被移除
    fn release_if_unreferenced(&self, stream_id: &str) {
        let subscribed = lock_unpoisoned(&self.inner.subscribers)
            .by_stream
            .contains_key(stream_id);
        if subscribed {
            return;
        }
        let mut sessions = lock_unpoisoned(&self.inner.sessions);
        if sessions.get(stream_id).is_some_and(|s| !s.has_producer()) {
            sessions.remove(stream_id);
            tracing::debug!(stream_id, "session released");
        }
    }

    /// 握手 → 初始化流水线 → 返回生产者句柄
    pub async fn open_producer(&self, handshake: Handshake) -> Result<ProducerHandle> {
        let stream_id = handshake.stream_id.clone();
        // 在会话表锁内占位, 与 release_if_unreferenced 互斥
        let session = {
            let mut sessions = lock_unpoisoned(&self.inner.sessions);
            let session = sessions
                .entry(stream_id.clone())
                .or_insert_with(|| {
                    tracing::debug!(stream_id = %stream_id, "session created");
                    Arc::new(StreamSession::new(&stream_id))
                })
                .clone();
            if !session.try_attach_producer() {
                return Err(HubError::ProtocolViolation(format!(
                    "stream {} already has a producer",
                    stream_id
                )));
            }
            session
        };
        // 之后任何错误路径都由 Drop 释放生产者位
        let handle = ProducerHandle {
            hub: self.clone(),
            session: session.clone(),
        };

        let mut pipeline = self
            .inner
            .kind
            .build(self.inner.deps.config.clone(), self.inner.deps.annotator.clone());
        let models = self.inner.deps.models.clone();
        let hs = handshake.clone();
        let pipeline = tokio::task::spawn_blocking(move || {
            pipeline.init_stream(&hs, models.as_ref()).map(|()| pipeline)
        })
        .await
        .map_err(|e| HubError::InitError(format!("init worker failed: {}", e)))?
        .map_err(|e| HubError::InitError(e.to_string()))?;

        session.install(pipeline, handshake.address.clone());
        tracing::info!(
            stream_id = %stream_id,
            pipeline = self.inner.kind.name(),
            "🎥 producer connected"
        );
        Ok(handle)
    }

    fn close_producer(&self, session: &StreamSession) {
        session.detach_producer();
        self.inner.deps.telemetry.forget(session.stream_id());
        self.release_if_unreferenced(session.stream_id());
        tracing::info!(stream_id = %session.stream_id(), "producer disconnected");
    }

    // ========== 订阅者 ==========

    /// 注册订阅者; `scope` 为 None 时接收所有流
    pub fn register_consumer(&self, scope: Option<String>) -> ConsumerHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.deps.consumer_buffer.max(1));
        if let Some(stream_id) = &scope {
            self.get_or_create_session(stream_id);
        }
        {
            let mut subs = lock_unpoisoned(&self.inner.subscribers);
            subs.senders.insert(id, tx);
            subs.attach(id, scope.clone());
        }
        tracing::info!(consumer_id = %id, scope = ?scope, "consumer registered");
        ConsumerHandle { id, rx }
    }

    /// 重新订阅: 原子地从旧集合移到新集合
    pub fn subscribe(&self, id: ConsumerId, scope: Option<String>) {
        if let Some(stream_id) = &scope {
            self.get_or_create_session(stream_id);
        }
        let previous = {
            let mut subs = lock_unpoisoned(&self.inner.subscribers);
            if !subs.senders.contains_key(&id) {
                return;
            }
            let previous = subs.detach(&id);
            subs.attach(id, scope.clone());
            previous
        };
        tracing::debug!(consumer_id = %id, scope = ?scope, "consumer resubscribed");
        if let Some(prev) = previous {
            if Some(&prev) != scope.as_ref() {
                self.release_if_unreferenced(&prev);
            }
        }
    }

    pub fn unregister(&self, id: ConsumerId) {
        let previous = lock_unpoisoned(&self.inner.subscribers).remove(&id);
        if let Some(prev) = previous {
            self.release_if_unreferenced(&prev);
        }
        tracing::info!(consumer_id = %id, "consumer unregistered");
    }

    pub fn consumer_count(&self) -> usize {
        lock_unpoisoned(&self.inner.subscribers).senders.len()
    }

    /// 某路流会收到的订阅者数 (含全局)
    pub fn recipient_count(&self, stream_id: &str) -> usize {
        let subs = lock_unpoisoned(&self.inner.subscribers);
        subs.by_stream.get(stream_id).map_or(0, |s| s.len()) + subs.global.len()
    }

    /// 广播到该流订阅者 ∪ 全局订阅者, 返回成功入队数
    pub fn broadcast(&self, stream_id: &str, payload: Bytes) -> usize {
        let recipients: Vec<(ConsumerId, mpsc::Sender<Bytes>)> = {
            let subs = lock_unpoisoned(&self.inner.subscribers);
            subs.by_stream
                .get(stream_id)
                .into_iter()
                .flatten()
                .chain(subs.global.iter())
                .filter_map(|id| subs.senders.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in recipients {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(consumer_id = %id, stream_id, "consumer queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            tracing::info!(consumer_id = %id, "pruning disconnected consumer");
            self.unregister(id);
        }
        delivered
    }

    // ========== 查询 ==========

    pub fn summary(&self, stream_id: &str) -> Option<serde_json::Value> {
        self.session(stream_id).map(|s| s.summary())
    }

    pub fn latest_frame(&self, stream_id: &str) -> Option<Bytes> {
        self.session(stream_id).and_then(|s| s.latest_frame())
    }
}

/// 生产者句柄; Drop 时释放生产者位并回收空闲会话
pub struct ProducerHandle {
    hub: StreamHub,
    session: Arc<StreamSession>,
}

impl ProducerHandle {
    pub fn stream_id(&self) -> &str {
        self.session.stream_id()
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    /// 处理一帧: 返回 ack JSON 文本; 解码/处理失败时跳过该帧 (无 ack、无广播)
    pub async fn handle_frame(&self, payload: Bytes) -> Result<String> {
        let deps = &self.hub.inner.deps;
        let session = self.session.clone();
        let quality = deps.config.jpeg_quality;
        let processed = tokio::task::spawn_blocking(move || session.process_payload(&payload, quality))
            .await
            .map_err(|e| HubError::FrameProcess(format!("frame worker failed: {}", e)))??;

        let stream_id = self.session.stream_id();
        let ts = chrono::Utc::now().timestamp_millis();

        let tick = deps.telemetry.maybe_publish(
            stream_id,
            &processed.metrics,
            self.session.address().as_ref(),
            Instant::now(),
        );
        if tick.is_some() {
            self.session.hold_metrics(processed.metrics.clone());
        }

        let held = self
            .session
            .held_metrics()
            .unwrap_or_else(|| processed.metrics.clone());
        let meta = FrameMeta::new(stream_id, ts, held);
        let envelope = encode_envelope(&meta, &processed.jpeg)
            .map_err(|e| HubError::FrameProcess(e.to_string()))?;
        let delivered = self.hub.broadcast(stream_id, envelope);
        tracing::trace!(stream_id, delivered, "frame broadcast");

        serde_json::to_string(&Ack::new(stream_id, ts, processed.metrics))
            .map_err(|e| HubError::FrameProcess(e.to_string()))
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.hub.close_producer(&self.session);
    }
}
