// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 智慧城市视频流分析中心 (Sensor-stream analytics hub)
///
/// 系统架构:
/// 1. producer 通过 WebSocket 推送编码帧 (握手 → 帧 → stop)
/// 2. 每路流独立的流水线: 标定测速 + 区域过滤 + 追踪 + 双通道融合 / 洪水分类
/// 3. 标注帧 + 指标广播给订阅的 consumer, 指标限速推送到 Orion-LD
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sensorhub_rs::config::{Args, PipelineConfig};
use sensorhub_rs::hub::{HubDeps, StreamHub};
use sensorhub_rs::models::ModelProvider;
use sensorhub_rs::pipeline::{Annotator, PipelineKind};
use sensorhub_rs::server::{router, AppState};
use sensorhub_rs::telemetry::{LogSink, OrionSink, TelemetryPublisher, TelemetrySink};

#[cfg(feature = "onnx")]
fn model_provider(args: &Args, config: &PipelineConfig) -> Arc<dyn ModelProvider> {
    tracing::info!("📦 追踪模型: {}", args.tracked_model.display());
    tracing::info!("📦 展示模型: {}", args.display_model.display());
    tracing::info!("📦 洪水模型: {}", args.flood_model.display());
    Arc::new(sensorhub_rs::models::OnnxModels {
        tracked: args.tracked_model.clone(),
        display: args.display_model.clone(),
        flood: args.flood_model.clone(),
        flood_labels: config.flood_labels.clone(),
    })
}

#[cfg(not(feature = "onnx"))]
fn model_provider(_args: &Args, _config: &PipelineConfig) -> Arc<dyn ModelProvider> {
    tracing::warn!("⚠️  未启用 onnx 功能, 所有流初始化都会失败 (cargo run --features onnx)");
    Arc::new(sensorhub_rs::models::UnavailableModels)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensorhub_rs=debug,sensorhub=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Arc::new(PipelineConfig::load(&args.config));

    tracing::info!("🚀 流分析中心启动");

    let sink: Arc<dyn TelemetrySink> = match &args.orion_url {
        Some(url) => {
            let sink = OrionSink::new(url, &args.fiware_service, &args.fiware_service_path);
            tracing::info!("📡 遥测目标: {}", sink.url());
            Arc::new(sink)
        }
        None => {
            tracing::info!("📡 未配置 ORION_URL, 遥测只写日志");
            Arc::new(LogSink)
        }
    };
    let telemetry = TelemetryPublisher::new(sink, args.telemetry_interval());

    let deps = HubDeps {
        config: config.clone(),
        annotator: Arc::new(Annotator::load(args.font.as_deref(), config.zone_fill_alpha)),
        models: model_provider(&args, &config),
        telemetry,
        consumer_buffer: args.consumer_buffer,
    };
    let state = AppState {
        traffic: StreamHub::new(PipelineKind::Traffic, deps.clone()),
        flood: StreamHub::new(PipelineKind::Flood, deps),
    };

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("🌐 监听 {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 收到退出信号");
        })
        .await?;
    Ok(())
}
