// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! WebSocket / HTTP 接口
//!
//! | 路径 | 说明 |
//! |------|------|
//! | `/ws/process`                     | 交通流 producer |
//! | `/ws/frontend`                    | 交通流 consumer |
//! | `/ws/active_streams`              | 在线流列表 `{"streams": [..]}` |
//! | `/ws/streams/:id/summary`         | 会话汇总 |
//! | `/ws/streams/:id/latest.jpg`      | 最新标注帧 |
//! | `/ws/process/flood` 等            | 洪水分类同构接口 |

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;

use crate::error::HubError;
use crate::hub::StreamHub;
use crate::protocol::{ConsumerCommand, Handshake, ProducerCommand};

/// 两个 Hub: 交通流 + 洪水分类
#[derive(Clone)]
pub struct AppState {
    pub traffic: StreamHub,
    pub flood: StreamHub,
}

pub fn router(state: AppState) -> Router {
    let traffic = Router::new()
        .route("/ws/process", get(producer_ws))
        .route("/ws/frontend", get(consumer_ws))
        .route("/ws/active_streams", get(active_streams))
        .route("/ws/streams/:stream_id/summary", get(stream_summary))
        .route("/ws/streams/:stream_id/latest.jpg", get(latest_frame))
        .with_state(state.traffic);

    let flood = Router::new()
        .route("/ws/process/flood", get(producer_ws))
        .route("/ws/flood/frontend", get(consumer_ws))
        .route("/ws/flood/active_streams", get(active_streams))
        .route("/ws/flood/streams/:stream_id/summary", get(stream_summary))
        .route("/ws/flood/streams/:stream_id/latest.jpg", get(latest_frame))
        .with_state(state.flood);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(traffic)
        .merge(flood)
}

async fn producer_ws(ws: WebSocketUpgrade, State(hub): State<StreamHub>) -> Response {
    ws.on_upgrade(move |socket| run_producer(socket, hub))
}

async fn consumer_ws(ws: WebSocketUpgrade, State(hub): State<StreamHub>) -> Response {
    ws.on_upgrade(move |socket| run_consumer(socket, hub))
}

async fn active_streams(State(hub): State<StreamHub>) -> Json<serde_json::Value> {
    Json(json!({ "streams": hub.active_streams() }))
}

async fn stream_summary(
    State(hub): State<StreamHub>,
    Path(stream_id): Path<String>,
) -> Response {
    match hub.summary(&stream_id) {
        Some(summary) => Json(summary).into_response(),
        None => not_found(&stream_id),
    }
}

async fn latest_frame(State(hub): State<StreamHub>, Path(stream_id): Path<String>) -> Response {
    match hub.latest_frame(&stream_id) {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => not_found(&stream_id),
    }
}

fn not_found(stream_id: &str) -> Response {
    let err = HubError::UnknownStream(stream_id.to_string());
    (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response()
}

async fn close_with(socket: &mut WebSocket, err: &HubError) {
    tracing::warn!(code = err.close_code(), "closing connection: {}", err);
    let frame = CloseFrame {
        code: err.close_code(),
        reason: Cow::Owned(err.to_string()),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// 等待握手 (文本帧), 超时或格式错误为协议错误; 对端直接断开时返回 None
async fn read_handshake(socket: &mut WebSocket, hub: &StreamHub) -> Option<Result<Handshake, HubError>> {
    let timeout = hub.config().handshake_timeout();
    let first = match tokio::time::timeout(timeout, socket.recv()).await {
        Err(_) => {
            return Some(Err(HubError::ProtocolViolation(format!(
                "no handshake within {:?}",
                timeout
            ))))
        }
        Ok(None) | Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(msg))) => msg,
    };
    match first {
        Message::Text(text) => Some(Handshake::parse(&text)),
        Message::Close(_) => None,
        _ => Some(Err(HubError::ProtocolViolation(
            "first message must be a JSON handshake".to_string(),
        ))),
    }
}

/// Producer 连接: 握手 → 逐帧处理 (严格按接收顺序) → 断开时拆除会话
pub async fn run_producer(mut socket: WebSocket, hub: StreamHub) {
    let handshake = match read_handshake(&mut socket, &hub).await {
        Some(Ok(hs)) => hs,
        Some(Err(e)) => {
            close_with(&mut socket, &e).await;
            return;
        }
        None => return,
    };

    let producer = match hub.open_producer(handshake).await {
        Ok(p) => p,
        Err(e) => {
            close_with(&mut socket, &e).await;
            return;
        }
    };
    let stream_id = producer.stream_id().to_string();

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(stream_id = %stream_id, "producer socket error: {}", e);
                break;
            }
        };
        match msg {
            Message::Binary(data) => match producer.handle_frame(Bytes::from(data)).await {
                Ok(ack) => {
                    if let Err(e) = socket.send(Message::Text(ack)).await {
                        tracing::warn!(stream_id = %stream_id, "ack send failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!(stream_id = %stream_id, "⚠️  frame skipped: {}", e),
            },
            Message::Text(text) => match ProducerCommand::parse(&text) {
                Ok(ProducerCommand::Stop) => {
                    tracing::info!(stream_id = %stream_id, "producer requested stop");
                    break;
                }
                Ok(ProducerCommand::Unknown(action)) => {
                    tracing::warn!(stream_id = %stream_id, action = %action, "unknown control action ignored");
                }
                Err(e) => {
                    close_with(&mut socket, &e).await;
                    return;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    // producer 在此 drop, 会话随之拆除
}

/// Consumer 连接: 可选订阅消息 (超时默认全局) → 接收信封; 之后可随时重新订阅
pub async fn run_consumer(socket: WebSocket, hub: StreamHub) {
    let (mut sender, mut receiver) = socket.split();

    let timeout = hub.config().subscribe_timeout();
    let scope = match tokio::time::timeout(timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match ConsumerCommand::parse(&text) {
            Ok(ConsumerCommand::Subscribe(scope)) => scope,
            Ok(ConsumerCommand::Unknown(action)) => {
                tracing::debug!(action = %action, "unexpected consumer action, subscribing globally");
                None
            }
            Err(e) => {
                tracing::debug!("bad subscribe message, subscribing globally: {}", e);
                None
            }
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => return,
        Ok(Some(Ok(_))) | Err(_) => None,
    };

    let consumer = hub.register_consumer(scope);
    let id = consumer.id;
    let mut rx = consumer.rx;

    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Binary(payload.to_vec())).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match ConsumerCommand::parse(&text) {
                    Ok(ConsumerCommand::Subscribe(scope)) => recv_hub.subscribe(id, scope),
                    Ok(ConsumerCommand::Unknown(action)) => {
                        tracing::debug!(consumer_id = %id, action = %action, "ignored consumer message")
                    }
                    Err(e) => tracing::debug!(consumer_id = %id, "ignored consumer message: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(id);
}
