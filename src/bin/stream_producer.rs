// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 边缘推流客户端 (Edge stream producer)
///
/// 读取 JSON 流列表, 每路流: 握手 → 按 send_fps 推送目录中的图像帧 → 等待 ack → stop
///
/// ```json
/// [{ "stream_id": "cam-1", "frames_dir": "frames/cam-1",
///    "image_pts": [[..],..], "world_pts": [[..],..], "fps": 25, "send_fps": 5 }]
/// ```
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::Parser;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensorhub_rs::protocol::{Ack, Handshake};

#[derive(Parser, Debug)]
#[command(author, version, about = "推流客户端 / edge stream producer", long_about = None)]
struct Args {
    /// 流列表 (JSON 数组)
    streams: PathBuf,

    /// 服务地址
    #[arg(long, env = "SENSORHUB_URL", default_value = "ws://127.0.0.1:8000")]
    server: String,

    /// 同时推送的流数量
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// 以 base64 文本负载发送帧
    #[arg(long, default_value_t = false)]
    base64: bool,

    /// 每路流重复推送目录的次数
    #[arg(long, default_value_t = 1)]
    loops: u32,

    /// 每帧等待 ack 的秒数; 服务端跳过无法解码的帧时不会回复
    #[arg(long, default_value_t = 5.0)]
    ack_timeout_secs: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamSpec {
    #[serde(flatten)]
    handshake: Handshake,
    frames_dir: PathBuf,
    /// 推送帧率; 缺省与 fps 相同
    #[serde(default)]
    send_fps: Option<f32>,
    /// 使用洪水分类接口
    #[serde(default)]
    flood: bool,
}

/// 单帧 ack 等待结果
#[derive(Debug)]
enum AckWait {
    Acked(Box<Ack>),
    Unexpected(String),
    TimedOut,
    Closed(Option<String>),
}

async fn wait_for_ack<S>(rx: &mut S, timeout: Duration) -> Result<AckWait>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let wait = async {
        loop {
            match rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(match serde_json::from_str::<Ack>(&text) {
                        Ok(ack) => AckWait::Acked(Box::new(ack)),
                        Err(e) => AckWait::Unexpected(e.to_string()),
                    })
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(AckWait::Closed(frame.map(|f| format!("{} {}", f.code, f.reason))))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(AckWait::Closed(None)),
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Ok(AckWait::TimedOut),
    }
}

fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    if frames.is_empty() {
        bail!("no frames in {}", dir.display());
    }
    Ok(frames)
}

struct PushOptions {
    base64: bool,
    loops: u32,
    ack_timeout: Duration,
}

async fn run_stream(server: String, spec: StreamSpec, opts: &PushOptions) -> Result<()> {
    let stream_id = spec.handshake.stream_id.clone();
    let path = if spec.flood { "/ws/process/flood" } else { "/ws/process" };
    let url = format!("{}{}", server.trim_end_matches('/'), path);
    let frames = list_frames(&spec.frames_dir)?;

    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connect {}", url))?;
    let (mut tx, mut rx) = ws.split();
    tracing::info!(stream_id = %stream_id, frames = frames.len(), "🔗 connected to {}", url);

    tx.send(Message::Text(serde_json::to_string(&spec.handshake)?))
        .await?;

    let send_fps = spec
        .send_fps
        .or(spec.handshake.fps)
        .filter(|f| *f > 0.0)
        .unwrap_or(1.0);
    let mut ticker = tokio::time::interval(Duration::from_secs_f32(1.0 / send_fps));
    let mut acked = 0usize;

    'outer: for _ in 0..opts.loops.max(1) {
        for frame in &frames {
            ticker.tick().await;
            let bytes = tokio::fs::read(frame)
                .await
                .with_context(|| format!("read {}", frame.display()))?;
            let payload = if opts.base64 {
                base64::engine::general_purpose::STANDARD
                    .encode(&bytes)
                    .into_bytes()
            } else {
                bytes
            };
            tx.send(Message::Binary(payload)).await?;

            // 每帧等待 ack; 超时则继续下一帧
            match wait_for_ack(&mut rx, opts.ack_timeout).await? {
                AckWait::Acked(ack) => {
                    acked += 1;
                    tracing::debug!(stream_id = %stream_id, metrics = ?ack.metrics.metrics, "ack");
                }
                AckWait::Unexpected(e) => tracing::warn!(stream_id = %stream_id, "unexpected reply: {}", e),
                AckWait::TimedOut => {
                    tracing::warn!(stream_id = %stream_id, frame = %frame.display(), "⚠️  no ack within timeout, continuing")
                }
                AckWait::Closed(reason) => {
                    tracing::warn!(stream_id = %stream_id, close = ?reason, "❌ hub closed the stream");
                    break 'outer;
                }
            }
        }
    }

    let _ = tx
        .send(Message::Text(r#"{"action":"stop"}"#.to_string()))
        .await;
    let _ = tx.close().await;
    tracing::info!(stream_id = %stream_id, acked, "✅ stream finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_producer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let json = std::fs::read_to_string(&args.streams)
        .with_context(|| format!("cannot read {}", args.streams.display()))?;
    let specs: Vec<StreamSpec> = serde_json::from_str(&json).context("invalid stream list")?;
    tracing::info!("🚀 推送 {} 路流, 并发 {}", specs.len(), args.concurrency);

    let permits = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let mut tasks = Vec::new();
    for spec in specs {
        let permits = permits.clone();
        let server = args.server.clone();
        let opts = PushOptions {
            base64: args.base64,
            loops: args.loops,
            ack_timeout: Duration::try_from_secs_f32(args.ack_timeout_secs)
                .unwrap_or(Duration::from_secs(5)),
        };
        tasks.push(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let stream_id = spec.handshake.stream_id.clone();
            run_stream(server, spec, &opts)
                .await
                .with_context(|| format!("stream {}", stream_id))
        }));
    }

    let mut failed = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                tracing::error!("❌ {:#}", e);
            }
            Err(e) => {
                failed += 1;
                tracing::error!("❌ task panicked: {}", e);
            }
        }
    }
    if failed > 0 {
        bail!("{} stream(s) failed", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn missing_ack_times_out() {
        let mut rx = stream::pending::<Result<Message, tungstenite::Error>>();
        let wait = wait_for_ack(&mut rx, Duration::from_millis(50)).await.unwrap();
        assert!(matches!(wait, AckWait::TimedOut));
    }

    #[tokio::test]
    async fn ack_after_ping_is_accepted() {
        let ack = r#"{"type":"ack","metrics":{"stream_id":"cam","ts":1,"metrics":{"current_count":2,"current_avg_speed":12.5}}}"#;
        let mut rx = stream::iter(vec![
            Ok::<_, tungstenite::Error>(Message::Ping(vec![])),
            Ok(Message::Text(ack.to_string())),
        ]);
        match wait_for_ack(&mut rx, Duration::from_secs(1)).await.unwrap() {
            AckWait::Acked(ack) => assert_eq!(ack.metrics.stream_id, "cam"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_stream_ends_wait() {
        let mut rx = stream::iter(Vec::<Result<Message, tungstenite::Error>>::new());
        let wait = wait_for_ack(&mut rx, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(wait, AckWait::Closed(None)));
    }
}
