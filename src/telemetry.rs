// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 遥测推送 (NGSI-LD / Orion-LD)
//!
//! 每路流按固定最小间隔推送一次 `TrafficFlowObserved` 实体; 推送在阻塞线程中执行,
//! 失败只记录日志, 不影响帧处理。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::error::TelemetryError;
use crate::lock_unpoisoned;
use crate::pipeline::{FrameMetrics, TrafficMetrics};

pub const ENTITY_TYPE: &str = "TrafficFlowObserved";
pub const TRANSPORTATION_CONTEXT: &str =
    "https://raw.githubusercontent.com/smart-data-models/dataModel.Transportation/master/context.jsonld";
pub const NGSI_LD_CORE_CONTEXT: &str =
    "https://uri.etsi.org/ngsi-ld/v1/ngsi-ld-core-context.jsonld";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// 遥测目标
pub trait TelemetrySink: Send + Sync {
    /// 阻塞推送一个实体
    fn push(&self, entity: &Value) -> Result<(), TelemetryError>;
}

pub fn entity_id(stream_id: &str) -> String {
    format!("urn:ngsi-ld:{}:{}", ENTITY_TYPE, stream_id)
}

/// 构造 `TrafficFlowObserved` 实体
pub fn traffic_entity(
    stream_id: &str,
    metrics: &TrafficMetrics,
    address: Option<&Value>,
    observed: DateTime<Utc>,
) -> Value {
    let mut entity = json!({
        "id": entity_id(stream_id),
        "type": ENTITY_TYPE,
        "@context": [TRANSPORTATION_CONTEXT, NGSI_LD_CORE_CONTEXT],
        "averageVehicleSpeed": { "type": "Property", "value": metrics.current_avg_speed },
        "intensity": { "type": "Property", "value": metrics.current_count },
        "dateObserved": {
            "type": "Property",
            "value": observed.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
    });
    if let Some(address) = address {
        entity["address"] = json!({ "type": "Property", "value": address });
    }
    entity
}

/// Orion-LD upsert
pub struct OrionSink {
    agent: ureq::Agent,
    url: String,
    service: String,
    service_path: String,
}

impl OrionSink {
    pub fn new(base_url: &str, service: &str, service_path: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        Self {
            agent,
            url: format!(
                "{}/ngsi-ld/v1/entityOperations/upsert",
                base_url.trim_end_matches('/')
            ),
            service: service.to_string(),
            service_path: service_path.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TelemetrySink for OrionSink {
    fn push(&self, entity: &Value) -> Result<(), TelemetryError> {
        let body = serde_json::to_string(&[entity])?;
        let response = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/ld+json")
            .set("Fiware-Service", &self.service)
            .set("Fiware-ServicePath", &self.service_path)
            .send_string(&body);
        match response {
            Ok(resp) if matches!(resp.status(), 200 | 201 | 204) => Ok(()),
            Ok(resp) => Err(TelemetryError::Status(resp.status())),
            Err(ureq::Error::Status(code, _)) => Err(TelemetryError::Status(code)),
            Err(e) => Err(TelemetryError::Transport(e.to_string())),
        }
    }
}

/// 未配置 Orion 时只写日志
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn push(&self, entity: &Value) -> Result<(), TelemetryError> {
        tracing::info!(entity = %entity, "telemetry");
        Ok(())
    }
}

/// 新窗口开始: 本帧指标应被保持; 有遥测形式时附带后台推送任务
#[derive(Debug)]
pub struct WindowTick {
    pub push: Option<JoinHandle<()>>,
}

/// 限速推送器: 每路流每个间隔窗口最多推送一次
///
/// 同一个 sink 可以被多个 Hub 共享, 但每个 Hub 应通过 [`TelemetryPublisher::with_own_windows`]
/// 持有独立的窗口表, 否则同名流会互相消耗窗口。
#[derive(Clone)]
pub struct TelemetryPublisher {
    sink: Arc<dyn TelemetrySink>,
    interval: Duration,
    last_publish: Arc<Mutex<HashMap<String, Instant>>>,
}

impl TelemetryPublisher {
    pub fn new(sink: Arc<dyn TelemetrySink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_publish: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 共享 sink 与间隔, 窗口表独立
    pub fn with_own_windows(&self) -> Self {
        Self::new(self.sink.clone(), self.interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 是否到了新窗口; 返回 true 时同时记录窗口起点
    fn should_publish(&self, stream_id: &str, now: Instant) -> bool {
        let mut last = lock_unpoisoned(&self.last_publish);
        match last.get(stream_id) {
            Some(prev) if now.saturating_duration_since(*prev) < self.interval => false,
            _ => {
                last.insert(stream_id.to_string(), now);
                true
            }
        }
    }

    /// 后台推送; 无遥测形式的指标 (洪水) 返回 None
    fn publish(
        &self,
        stream_id: &str,
        metrics: &FrameMetrics,
        address: Option<&Value>,
    ) -> Option<JoinHandle<()>> {
        let traffic = metrics.as_traffic()?;
        let entity = traffic_entity(stream_id, traffic, address, Utc::now());
        let sink = self.sink.clone();
        let stream_id = stream_id.to_string();
        Some(tokio::task::spawn_blocking(move || {
            match sink.push(&entity) {
                Ok(()) => tracing::debug!(stream_id = %stream_id, "📡 telemetry pushed"),
                Err(e) => tracing::warn!(stream_id = %stream_id, "⚠️  遥测推送失败: {}", e),
            }
        }))
    }

    /// 限速检查 + 推送; 仍在当前窗口内时返回 None
    pub fn maybe_publish(
        &self,
        stream_id: &str,
        metrics: &FrameMetrics,
        address: Option<&Value>,
        now: Instant,
    ) -> Option<WindowTick> {
        if !self.should_publish(stream_id, now) {
            return None;
        }
        Some(WindowTick {
            push: self.publish(stream_id, metrics, address),
        })
    }

    /// 会话结束后清除该流的限速状态
    pub fn forget(&self, stream_id: &str) {
        lock_unpoisoned(&self.last_publish).remove(stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FloodMetrics;

    #[derive(Default)]
    struct Recording(Mutex<Vec<Value>>);

    impl TelemetrySink for Recording {
        fn push(&self, entity: &Value) -> Result<(), TelemetryError> {
            self.0.lock().unwrap().push(entity.clone());
            Ok(())
        }
    }

    fn traffic(count: usize, speed: f32) -> FrameMetrics {
        FrameMetrics::Traffic(TrafficMetrics {
            current_count: count,
            current_avg_speed: speed,
        })
    }

    #[test]
    fn entity_shape() {
        let observed = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let address = json!({"streetAddress": "Main St"});
        let entity = traffic_entity(
            "cam-7",
            &TrafficMetrics {
                current_count: 4,
                current_avg_speed: 37.5,
            },
            Some(&address),
            observed,
        );
        assert_eq!(entity["id"], "urn:ngsi-ld:TrafficFlowObserved:cam-7");
        assert_eq!(entity["type"], "TrafficFlowObserved");
        assert_eq!(entity["@context"][0], TRANSPORTATION_CONTEXT);
        assert_eq!(entity["averageVehicleSpeed"]["value"], 37.5);
        assert_eq!(entity["intensity"]["value"], 4);
        assert_eq!(entity["dateObserved"]["value"], "2024-05-01T12:00:00.000Z");
        assert_eq!(entity["address"]["value"]["streetAddress"], "Main St");

        let bare = traffic_entity("x", &TrafficMetrics::default(), None, observed);
        assert!(bare.get("address").is_none());
    }

    #[test]
    fn orion_url() {
        let sink = OrionSink::new("http://orion:1026/", "openiot", "/");
        assert_eq!(sink.url(), "http://orion:1026/ngsi-ld/v1/entityOperations/upsert");
    }

    #[tokio::test]
    async fn rate_limited_per_stream() {
        let sink = Arc::new(Recording::default());
        let publisher = TelemetryPublisher::new(sink.clone(), Duration::from_secs(5));
        let t0 = Instant::now();

        // 12 秒内每秒一帧 → 第 0、5、10 秒各推送一次
        let mut handles = Vec::new();
        for s in 0..12u64 {
            let now = t0 + Duration::from_secs(s);
            if let Some(tick) = publisher.maybe_publish("A", &traffic(s as usize, 10.0), None, now) {
                handles.extend(tick.push);
            }
        }
        // 另一路流独立计时
        handles.extend(
            publisher
                .maybe_publish("B", &traffic(1, 1.0), None, t0)
                .and_then(|tick| tick.push),
        );
        for h in handles {
            h.await.unwrap();
        }

        let pushed = sink.0.lock().unwrap();
        let a: Vec<&Value> = pushed
            .iter()
            .filter(|e| e["id"] == entity_id("A"))
            .collect();
        assert_eq!(a.len(), 3);
        let intensities: Vec<i64> = a
            .iter()
            .map(|e| e["intensity"]["value"].as_i64().unwrap())
            .collect();
        let mut sorted = intensities.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 5, 10]);
        assert_eq!(pushed.len(), 4);
    }

    #[tokio::test]
    async fn flood_metrics_tick_without_push() {
        let sink = Arc::new(Recording::default());
        let publisher = TelemetryPublisher::new(sink.clone(), Duration::from_secs(5));
        let metrics = FrameMetrics::Flood(FloodMetrics {
            is_flood: true,
            score: 0.9,
            frames_processed: 1,
        });
        let now = Instant::now();
        let tick = publisher.maybe_publish("F", &metrics, None, now).unwrap();
        assert!(tick.push.is_none());
        assert!(publisher
            .maybe_publish("F", &metrics, None, now + Duration::from_secs(1))
            .is_none());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn own_windows_share_sink_but_not_rate_limit() {
        let sink = Arc::new(Recording::default());
        let traffic_side = TelemetryPublisher::new(sink.clone(), Duration::from_secs(5));
        let flood_side = traffic_side.with_own_windows();
        let now = Instant::now();

        let flood = FrameMetrics::Flood(FloodMetrics::default());
        assert!(flood_side.maybe_publish("cam", &flood, None, now).is_some());
        let tick = traffic_side
            .maybe_publish("cam", &traffic(2, 30.0), None, now)
            .unwrap();
        tick.push.unwrap().await.unwrap();

        flood_side.forget("cam");
        assert!(traffic_side
            .maybe_publish("cam", &traffic(3, 30.0), None, now + Duration::from_secs(1))
            .is_none());
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn forget_resets_window() {
        let publisher = TelemetryPublisher::new(Arc::new(LogSink), Duration::from_secs(5));
        let now = Instant::now();
        assert!(publisher.should_publish("A", now));
        assert!(!publisher.should_publish("A", now + Duration::from_secs(1)));
        publisher.forget("A");
        assert!(publisher.should_publish("A", now + Duration::from_secs(2)));
    }
}
