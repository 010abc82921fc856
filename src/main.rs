// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/main.rs - 识别服务主程序
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use miaojian::{
  args::Args,
  backend::NativeBackend,
  labels::CategoryCatalog,
  output::draw::Draw,
  publish::ResultPublisher,
  server::{AppState, ServerSettings, router},
  session::CameraSessions,
  transcode::Transcoder,
};

const DEFAULT_LOG_FILTER: &str = "miaojian=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
  dotenvy::dotenv().ok();

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
  tracing_subscriber::registry()
    .with(fmt::layer().with_target(true))
    .with(filter)
    .init();

  let args = Args::parse();
  info!("Miaojian 作物病害识别服务");
  info!("权重目录: {}", args.weights_dir.display());
  info!("工作目录: {}", args.work_dir.display());
  info!("摄像头: {} ({} fps)", args.camera, args.camera_fps);

  gstreamer::init().context("GStreamer 初始化失败")?;

  let catalog = match &args.labels {
    Some(path) => CategoryCatalog::from_file(path)
      .with_context(|| format!("无法加载类别表 {}", path.display()))?,
    None => CategoryCatalog::builtin()?,
  };
  info!("作物种类: {}", catalog.kinds().collect::<Vec<_>>().join(", "));

  let draw = match &args.font {
    Some(path) => Draw::with_font_file(path)
      .with_context(|| format!("无法加载字体 {}", path.display()))?,
    None => {
      warn!("未指定字体，结果图像只绘制检测框");
      Draw::default()
    }
  };

  let transcoder = Transcoder::new(&args.ffmpeg, &args.ffprobe);
  if let Err(e) = transcoder.check() {
    warn!("{}，视频转码将失败", e);
  }

  tokio::fs::create_dir_all(args.work_dir.join("video"))
    .await
    .with_context(|| format!("无法创建工作目录 {}", args.work_dir.display()))?;

  let backend = NativeBackend::new(args.camera.clone(), args.camera_fps, args.nms_threshold);
  let state = AppState::new(
    ServerSettings::from(&args),
    Arc::new(backend),
    Arc::new(transcoder),
    ResultPublisher::new(args.endpoints()),
    catalog,
    draw,
  );
  let sessions = state.sessions.clone();

  let address = args.bind_address();
  let listener = tokio::net::TcpListener::bind(&address)
    .await
    .with_context(|| format!("无法监听 {}", address))?;
  info!("服务已启动: http://{}", address);

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal(sessions))
    .await
    .context("服务异常退出")?;

  info!("服务已停止");
  Ok(())
}

async fn shutdown_signal(sessions: CameraSessions) {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!("无法监听 Ctrl-C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        warn!("无法监听 SIGTERM: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }

  info!("收到退出信号，正在停止所有推流");
  sessions.shutdown();
}
