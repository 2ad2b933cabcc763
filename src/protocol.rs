// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 连接协议 (producer / consumer wire formats)
//!
//! Producer → hub:
//! - 握手 (text, 连接后第一条): [`Handshake`]
//! - 帧 (binary): 编码图像字节, 或 base64 文本形式的编码图像字节
//! - 控制 (text): `{"action":"stop"}`
//!
//! Hub → producer: 每帧一条 ack (text), 见 [`Ack`]。
//!
//! Consumer → hub: `{"action":"subscribe","stream_id":"..."}`, stream_id 缺省为全局订阅。
//!
//! Hub → consumer (binary): 4 字节大端长度 + UTF-8 JSON 元数据 [`FrameMeta`] + JPEG 字节。

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::geometry::Point;
use crate::pipeline::FrameMetrics;

/// 生产者握手
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub stream_id: String,
    #[serde(default)]
    pub image_pts: Vec<Point>,
    #[serde(default)]
    pub world_pts: Vec<Point>,
    /// 区域多边形; 缺省使用 image_pts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_pts: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_cfg: Option<String>,
    #[serde(default, alias = "yolo_weights", skip_serializing_if = "Option::is_none")]
    pub model_weights: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<serde_json::Value>,
}

impl Handshake {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            image_pts: Vec::new(),
            world_pts: Vec::new(),
            zone_pts: None,
            classes: None,
            conf: None,
            tracker_cfg: None,
            model_weights: None,
            fps: None,
            address: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, HubError> {
        let handshake: Handshake = serde_json::from_str(text)
            .map_err(|e| HubError::ProtocolViolation(format!("bad handshake: {}", e)))?;
        if handshake.stream_id.trim().is_empty() {
            return Err(HubError::ProtocolViolation(
                "handshake without stream_id".to_string(),
            ));
        }
        if let Some(fps) = handshake.fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(HubError::ProtocolViolation(format!("invalid fps {}", fps)));
            }
        }
        Ok(handshake)
    }
}

#[derive(Debug, Deserialize)]
struct RawControl {
    action: String,
    #[serde(default)]
    stream_id: Option<String>,
}

/// 生产者控制命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerCommand {
    Stop,
    Unknown(String),
}

impl ProducerCommand {
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let raw: RawControl = serde_json::from_str(text)
            .map_err(|e| HubError::ProtocolViolation(format!("bad control message: {}", e)))?;
        Ok(match raw.action.as_str() {
            "stop" => ProducerCommand::Stop,
            other => ProducerCommand::Unknown(other.to_string()),
        })
    }
}

/// 订阅者命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCommand {
    /// None = 全局订阅
    Subscribe(Option<String>),
    Unknown(String),
}

impl ConsumerCommand {
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let raw: RawControl = serde_json::from_str(text)
            .map_err(|e| HubError::ProtocolViolation(format!("bad subscribe message: {}", e)))?;
        Ok(match raw.action.as_str() {
            "subscribe" => {
                ConsumerCommand::Subscribe(raw.stream_id.filter(|s| !s.trim().is_empty()))
            }
            other => ConsumerCommand::Unknown(other.to_string()),
        })
    }

    pub fn subscribe(stream_id: Option<&str>) -> String {
        serde_json::json!({ "action": "subscribe", "stream_id": stream_id }).to_string()
    }
}

/// 每帧回执
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    #[serde(rename = "type")]
    pub kind: String,
    pub metrics: AckBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckBody {
    pub stream_id: String,
    pub ts: i64,
    pub metrics: FrameMetrics,
}

impl Ack {
    pub fn new(stream_id: &str, ts: i64, metrics: FrameMetrics) -> Self {
        Self {
            kind: "ack".to_string(),
            metrics: AckBody {
                stream_id: stream_id.to_string(),
                ts,
                metrics,
            },
        }
    }
}

/// 广播帧元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameMeta {
    #[serde(rename = "type")]
    pub kind: String,
    pub stream_id: String,
    pub ts: i64,
    pub metrics: FrameMetrics,
}

impl FrameMeta {
    pub fn new(stream_id: &str, ts: i64, metrics: FrameMetrics) -> Self {
        Self {
            kind: "frame".to_string(),
            stream_id: stream_id.to_string(),
            ts,
            metrics,
        }
    }
}

/// 打包广播信封: `u32 BE 长度 | JSON 元数据 | 图像字节`
pub fn encode_envelope(meta: &FrameMeta, image: &[u8]) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_vec(meta)?;
    let mut buf = BytesMut::with_capacity(4 + json.len() + image.len());
    buf.put_u32(json.len() as u32);
    buf.put_slice(&json);
    buf.put_slice(image);
    Ok(buf.freeze())
}

/// 解析广播信封, 返回 (元数据, 图像字节)
pub fn decode_envelope(mut payload: Bytes) -> Result<(FrameMeta, Bytes), HubError> {
    if payload.len() < 4 {
        return Err(HubError::ProtocolViolation("envelope shorter than header".into()));
    }
    let len = payload.get_u32() as usize;
    if payload.len() < len {
        return Err(HubError::ProtocolViolation(format!(
            "envelope header claims {} bytes of metadata, {} available",
            len,
            payload.len()
        )));
    }
    let json = payload.split_to(len);
    let meta = serde_json::from_slice(&json)
        .map_err(|e| HubError::ProtocolViolation(format!("bad envelope metadata: {}", e)))?;
    Ok((meta, payload))
}

/// 帧负载: 先尝试 base64 解码, 失败则视为原始图像字节
pub fn decode_frame_payload(payload: &[u8]) -> Bytes {
    if let Ok(text) = std::str::from_utf8(payload) {
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(text.trim()) {
            return Bytes::from(decoded);
        }
    }
    Bytes::copy_from_slice(payload)
}
