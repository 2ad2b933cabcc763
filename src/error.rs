// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 错误类型
//! Error taxonomy for the stream hub and its per-stream pipelines

use thiserror::Error;

/// WebSocket close code: malformed or missing handshake / control message
pub const CLOSE_PROTOCOL_VIOLATION: u16 = 1003;

/// WebSocket close code: stream could not be initialised
pub const CLOSE_INIT_ERROR: u16 = 1011;

/// 标定错误
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("calibrator used before calibrate()")]
    NotCalibrated,

    #[error("degenerate point correspondences")]
    Degenerate,
}

/// 单帧处理错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline not initialized")]
    NotInitialized,

    #[error("init failed: {0}")]
    Init(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("model failure: {0:#}")]
    Model(#[from] anyhow::Error),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Hub 连接层错误
#[derive(Debug, Error)]
pub enum HubError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stream init failed: {0}")]
    InitError(String),

    #[error("frame decode failed: {0}")]
    FrameDecode(String),

    #[error("frame processing failed: {0}")]
    FrameProcess(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),
}

impl HubError {
    /// Close code sent to the peer before the connection is dropped.
    pub fn close_code(&self) -> u16 {
        match self {
            HubError::InitError(_) => CLOSE_INIT_ERROR,
            _ => CLOSE_PROTOCOL_VIOLATION,
        }
    }

    /// Whether the error ends the connection or only skips one frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HubError::ProtocolViolation(_) | HubError::InitError(_))
    }
}

impl From<PipelineError> for HubError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(msg) => HubError::FrameDecode(msg),
            PipelineError::Init(msg) => HubError::InitError(msg),
            PipelineError::Calibration(e) => HubError::InitError(e.to_string()),
            other => HubError::FrameProcess(other.to_string()),
        }
    }
}

/// 遥测推送错误
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry sink rejected upsert with status {0}")]
    Status(u16),

    #[error("telemetry transport error: {0}")]
    Transport(String),

    #[error("telemetry payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_codes_follow_error_kind() {
        assert_eq!(HubError::ProtocolViolation("x".into()).close_code(), 1003);
        assert_eq!(HubError::InitError("x".into()).close_code(), 1011);
    }

    #[test]
    fn frame_errors_are_not_fatal() {
        let err: HubError = PipelineError::Decode("bad jpeg".into()).into();
        assert!(matches!(err, HubError::FrameDecode(_)));
        assert!(!err.is_fatal());

        let err: HubError = PipelineError::Calibration(CalibrationError::Degenerate).into();
        assert!(err.is_fatal());
    }
}
