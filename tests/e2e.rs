// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! E2E 回归测试
//!
//! 在 127.0.0.1:0 上启动真实 axum 服务, 使用脚本化的假模型 (不需要 ONNX 权重),
//! 通过 tokio-tungstenite 客户端走完整链路:
//!
//! - producer → 握手 → 帧 → ack
//! - producer → hub → consumer (按流订阅 / 全局订阅)
//! - 协议错误 / 初始化失败的关闭码
//!
//! Run: `cargo test --test e2e`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use image::RgbImage;
use tokio_tungstenite::tungstenite;

use sensorhub_rs::detection::BBox;
use sensorhub_rs::hub::{HubDeps, StreamHub};
use sensorhub_rs::models::{Classification, Classifier, Detector, ModelProvider};
use sensorhub_rs::pipeline::{encode_jpeg, Annotator, FrameMetrics, PipelineKind};
use sensorhub_rs::protocol::{decode_envelope, Ack, ConsumerCommand};
use sensorhub_rs::server::{router, AppState};
use sensorhub_rs::telemetry::{LogSink, TelemetryPublisher, TelemetrySink};
use sensorhub_rs::PipelineConfig;

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── 假模型 ──────────────────────────────────────────────────────────

/// 一辆车, 每帧右移 10 px
struct SlidingCar {
    calls: usize,
}

impl Detector for SlidingCar {
    fn detect(&mut self, _image: &RgbImage, _conf: f32) -> anyhow::Result<Vec<BBox>> {
        let dx = 10.0 * self.calls as f32;
        self.calls += 1;
        Ok(vec![BBox::new(20.0 + dx, 40.0, 40.0 + dx, 60.0, 0.9, 2)])
    }
}

struct AlwaysFlooded;

impl Classifier for AlwaysFlooded {
    fn classify(&mut self, _image: &RgbImage, _top_k: usize) -> anyhow::Result<Vec<Classification>> {
        Ok(vec![
            Classification {
                label: "Flooded Scene".to_string(),
                score: 0.8,
            },
            Classification {
                label: "Non Flooded".to_string(),
                score: 0.2,
            },
        ])
    }
}

struct FakeModels;

impl ModelProvider for FakeModels {
    fn tracked_detector(&self, weights: Option<&str>) -> anyhow::Result<Box<dyn Detector>> {
        if weights == Some("missing.onnx") {
            bail!("weights not found");
        }
        Ok(Box::new(SlidingCar { calls: 0 }))
    }

    fn display_detector(&self) -> anyhow::Result<Box<dyn Detector>> {
        Ok(Box::new(SlidingCar { calls: 0 }))
    }

    fn flood_classifier(&self) -> anyhow::Result<Box<dyn Classifier>> {
        Ok(Box::new(AlwaysFlooded))
    }
}

// ── 服务与客户端辅助 ────────────────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    state: AppState,
}

async fn start_server() -> TestServer {
    start_server_with(PipelineConfig::default()).await
}

async fn start_server_with(config: PipelineConfig) -> TestServer {
    let sink: Arc<dyn TelemetrySink> = Arc::new(LogSink);
    let deps = HubDeps {
        config: Arc::new(config),
        annotator: Arc::new(Annotator::new(None, 0.2)),
        models: Arc::new(FakeModels),
        telemetry: TelemetryPublisher::new(sink, Duration::from_secs(5)),
        consumer_buffer: 16,
    };
    let state = AppState {
        traffic: StreamHub::new(PipelineKind::Traffic, deps.clone()),
        flood: StreamHub::new(PipelineKind::Flood, deps),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, state }
}

async fn connect(addr: SocketAddr, path: &str) -> WsClient {
    let url = format!("ws://{}{}", addr, path);
    let (stream, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("websocket connect");
    stream
}

fn handshake(stream_id: &str) -> String {
    serde_json::json!({
        "stream_id": stream_id,
        "image_pts": [[0, 0], [100, 0], [100, 100], [0, 100]],
        "world_pts": [[0, 0], [10, 0], [10, 10], [0, 10]],
        "fps": 1,
        "address": {"streetAddress": "Test Rd"}
    })
    .to_string()
}

fn jpeg_frame() -> Vec<u8> {
    encode_jpeg(&RgbImage::from_pixel(120, 120, image::Rgb([90, 90, 90])), 80).unwrap()
}

/// 等待下一条文本消息
async fn next_text(ws: &mut WsClient) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => return text,
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// 等待关闭帧, 返回关闭码
async fn close_code(ws: &mut WsClient) -> Option<u16> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(tungstenite::Message::Close(frame)))) => {
                return frame.map(|f| u16::from(f.code))
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

/// 收集二进制消息直到超时
async fn collect_ws_messages(ws: &mut WsClient, timeout: Duration) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(tungstenite::Message::Binary(data)))) => messages.push(data.to_vec()),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => break,
        }
    }
    messages
}

async fn subscribe(ws: &mut WsClient, stream_id: Option<&str>) {
    ws.send(tungstenite::Message::Text(ConsumerCommand::subscribe(stream_id)))
        .await
        .unwrap();
}

/// 等待 hub 注册完指定数量的订阅者
async fn wait_for_consumers(hub: &StreamHub, n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while hub.consumer_count() < n {
        assert!(tokio::time::Instant::now() < deadline, "consumers never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, Vec<u8>) {
    let url = format!("http://{}{}", addr, path);
    tokio::task::spawn_blocking(move || {
        let response = match ureq::get(&url).call() {
            Ok(r) => r,
            Err(ureq::Error::Status(_, r)) => r,
            Err(e) => panic!("request failed: {}", e),
        };
        let status = response.status();
        let mut body = Vec::new();
        std::io::Read::read_to_end(&mut response.into_reader(), &mut body).unwrap();
        (status, body)
    })
    .await
    .unwrap()
}

// ── 测试 ────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn frames_fan_out_to_matching_consumers() {
    let server = start_server().await;

    let mut on_a = connect(server.addr, "/ws/frontend").await;
    subscribe(&mut on_a, Some("A")).await;
    let mut on_a2 = connect(server.addr, "/ws/frontend").await;
    subscribe(&mut on_a2, Some("A")).await;
    let mut global = connect(server.addr, "/ws/frontend").await;
    subscribe(&mut global, None).await;
    let mut on_b = connect(server.addr, "/ws/frontend").await;
    subscribe(&mut on_b, Some("B")).await;
    wait_for_consumers(&server.state.traffic, 4).await;

    let mut producer = connect(server.addr, "/ws/process").await;
    producer
        .send(tungstenite::Message::Text(handshake("A")))
        .await
        .unwrap();

    let mut acks = Vec::new();
    for _ in 0..2 {
        producer
            .send(tungstenite::Message::Binary(jpeg_frame()))
            .await
            .unwrap();
        let ack: Ack = serde_json::from_str(&next_text(&mut producer).await).unwrap();
        acks.push(ack);
    }

    assert_eq!(acks[0].kind, "ack");
    assert_eq!(acks[1].metrics.stream_id, "A");
    match &acks[1].metrics.metrics {
        FrameMetrics::Traffic(m) => {
            assert_eq!(m.current_count, 1);
            assert!((m.current_avg_speed - 3.6).abs() < 1e-4, "speed {}", m.current_avg_speed);
        }
        other => panic!("unexpected metrics {:?}", other),
    }

    for ws in [&mut on_a, &mut on_a2, &mut global] {
        let messages = collect_ws_messages(ws, Duration::from_millis(500)).await;
        assert_eq!(messages.len(), 2);
        let (meta, jpeg) = decode_envelope(Bytes::from(messages[0].clone())).unwrap();
        assert_eq!(meta.kind, "frame");
        assert_eq!(meta.stream_id, "A");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
    assert!(collect_ws_messages(&mut on_b, Duration::from_millis(300))
        .await
        .is_empty());

    let (status, body) = http_get(server.addr, "/ws/active_streams").await;
    assert_eq!(status, 200);
    let active: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(active, serde_json::json!({ "streams": ["A"] }));

    let (status, body) = http_get(server.addr, "/ws/streams/A/summary").await;
    assert_eq!(status, 200);
    let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary["summary"]["total_tracked_vehicles"], 1);
    assert_eq!(summary["summary"]["vehicle_counts_by_class"]["car"], 1);

    let (status, body) = http_get(server.addr, "/ws/streams/A/latest.jpg").await;
    assert_eq!(status, 200);
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let (status, _) = http_get(server.addr, "/ws/streams/nope/summary").await;
    assert_eq!(status, 404);

    // stop → 会话拆除
    producer
        .send(tungstenite::Message::Text(r#"{"action":"stop"}"#.into()))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !server.state.traffic.active_streams().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "stream not torn down");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn base64_frames_are_accepted() {
    use base64::Engine;
    let server = start_server().await;
    let mut producer = connect(server.addr, "/ws/process").await;
    producer
        .send(tungstenite::Message::Text(handshake("b64")))
        .await
        .unwrap();
    let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg_frame());
    producer
        .send(tungstenite::Message::Binary(encoded.into_bytes()))
        .await
        .unwrap();
    let ack: Ack = serde_json::from_str(&next_text(&mut producer).await).unwrap();
    assert_eq!(ack.metrics.stream_id, "b64");
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_handshake_closes_with_1003() {
    let server = start_server().await;
    let mut producer = connect(server.addr, "/ws/process").await;
    producer
        .send(tungstenite::Message::Text("{ not json".into()))
        .await
        .unwrap();
    assert_eq!(close_code(&mut producer).await, Some(1003));
    assert!(server.state.traffic.active_streams().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_producer_times_out_with_1003() {
    let config = PipelineConfig {
        handshake_timeout_secs: 0.3,
        ..PipelineConfig::default()
    };
    let server = start_server_with(config).await;
    let mut producer = connect(server.addr, "/ws/process").await;

    let started = tokio::time::Instant::now();
    assert_eq!(close_code(&mut producer).await, Some(1003));
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(server.state.traffic.active_streams().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn init_failure_closes_with_1011() {
    let server = start_server().await;

    // 标定点不足
    let mut producer = connect(server.addr, "/ws/process").await;
    let hs = serde_json::json!({
        "stream_id": "bad",
        "image_pts": [[0, 0], [1, 0], [1, 1]],
        "world_pts": [[0, 0], [1, 0], [1, 1]],
    });
    producer
        .send(tungstenite::Message::Text(hs.to_string()))
        .await
        .unwrap();
    assert_eq!(close_code(&mut producer).await, Some(1011));

    // 模型加载失败
    let mut producer = connect(server.addr, "/ws/process").await;
    let mut hs: serde_json::Value = serde_json::from_str(&handshake("bad2")).unwrap();
    hs["model_weights"] = "missing.onnx".into();
    producer
        .send(tungstenite::Message::Text(hs.to_string()))
        .await
        .unwrap();
    assert_eq!(close_code(&mut producer).await, Some(1011));
    assert!(server.state.traffic.active_streams().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_producer_is_rejected() {
    let server = start_server().await;
    let mut first = connect(server.addr, "/ws/process").await;
    first
        .send(tungstenite::Message::Text(handshake("dup")))
        .await
        .unwrap();
    first
        .send(tungstenite::Message::Binary(jpeg_frame()))
        .await
        .unwrap();
    next_text(&mut first).await;

    let mut second = connect(server.addr, "/ws/process").await;
    second
        .send(tungstenite::Message::Text(handshake("dup")))
        .await
        .unwrap();
    assert_eq!(close_code(&mut second).await, Some(1003));

    // 第一个 producer 不受影响
    first
        .send(tungstenite::Message::Binary(jpeg_frame()))
        .await
        .unwrap();
    let ack: Ack = serde_json::from_str(&next_text(&mut first).await).unwrap();
    assert_eq!(ack.metrics.stream_id, "dup");
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnected_consumer_does_not_block_others() {
    let server = start_server().await;
    let mut stays = connect(server.addr, "/ws/frontend").await;
    subscribe(&mut stays, Some("S")).await;
    let mut leaves = connect(server.addr, "/ws/frontend").await;
    subscribe(&mut leaves, Some("S")).await;
    wait_for_consumers(&server.state.traffic, 2).await;
    drop(leaves);

    let mut producer = connect(server.addr, "/ws/process").await;
    producer
        .send(tungstenite::Message::Text(handshake("S")))
        .await
        .unwrap();
    for _ in 0..3 {
        producer
            .send(tungstenite::Message::Binary(jpeg_frame()))
            .await
            .unwrap();
        next_text(&mut producer).await;
    }

    let messages = collect_ws_messages(&mut stays, Duration::from_millis(500)).await;
    assert_eq!(messages.len(), 3);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.state.traffic.consumer_count() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "dead consumer not pruned");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn flood_stream_reports_classification() {
    let server = start_server().await;

    let mut consumer = connect(server.addr, "/ws/flood/frontend").await;
    subscribe(&mut consumer, Some("river")).await;
    wait_for_consumers(&server.state.flood, 1).await;

    let mut producer = connect(server.addr, "/ws/process/flood").await;
    producer
        .send(tungstenite::Message::Text(
            serde_json::json!({"stream_id": "river"}).to_string(),
        ))
        .await
        .unwrap();
    producer
        .send(tungstenite::Message::Binary(jpeg_frame()))
        .await
        .unwrap();

    let ack: Ack = serde_json::from_str(&next_text(&mut producer).await).unwrap();
    match ack.metrics.metrics {
        FrameMetrics::Flood(m) => {
            assert!(m.is_flood);
            assert_eq!(m.score, 0.8);
            assert_eq!(m.frames_processed, 1);
        }
        other => panic!("unexpected metrics {:?}", other),
    }

    let messages = collect_ws_messages(&mut consumer, Duration::from_millis(500)).await;
    assert_eq!(messages.len(), 1);

    let (status, body) = http_get(server.addr, "/ws/flood/active_streams").await;
    assert_eq!(status, 200);
    let active: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(active, serde_json::json!({ "streams": ["river"] }));
}
