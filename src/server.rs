// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use axum::{
  Router,
  routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
  args::Args,
  backend::MediaBackend,
  labels::CategoryCatalog,
  notify::Notifier,
  output::draw::Draw,
  publish::ResultPublisher,
  session::CameraSessions,
  task::{PipelineContext, PipelineRequest, StreamPipeline},
  transcode::Transcode,
};

mod error;
mod handlers;
mod request;
mod ws;

pub use self::error::ApiError;
pub use self::handlers::{MULTIPART_CONTENT_TYPE, SESSION_HEADER};
pub use self::request::{
  ApiJson, ApiQuery, CameraQuery, ImgResponse, PredictImgBody, StopQuery, StopResponse,
  VideoQuery, WeightItem, WeightList,
};

/// 处理请求需要的本地配置
#[derive(Debug, Clone)]
pub struct ServerSettings {
  pub weights_dir: PathBuf,
  pub work_dir: PathBuf,
  pub camera_fps: u32,
  pub jpeg_quality: u8,
}

impl From<&Args> for ServerSettings {
  fn from(args: &Args) -> Self {
    Self {
      weights_dir: args.weights_dir.clone(),
      work_dir: args.work_dir.clone(),
      camera_fps: args.camera_fps,
      jpeg_quality: args.jpeg_quality,
    }
  }
}

#[derive(Clone)]
pub struct AppState {
  pub settings: Arc<ServerSettings>,
  pub backend: Arc<dyn MediaBackend>,
  pub transcoder: Arc<dyn Transcode>,
  pub publisher: ResultPublisher,
  pub catalog: Arc<CategoryCatalog>,
  pub draw: Draw,
  pub notifier: Notifier,
  pub sessions: CameraSessions,
}

impl AppState {
  pub fn new(
    settings: ServerSettings,
    backend: Arc<dyn MediaBackend>,
    transcoder: Arc<dyn Transcode>,
    publisher: ResultPublisher,
    catalog: CategoryCatalog,
    draw: Draw,
  ) -> Self {
    Self {
      settings: Arc::new(settings),
      backend,
      transcoder,
      publisher,
      catalog: Arc::new(catalog),
      draw,
      notifier: Notifier::default(),
      sessions: CameraSessions::default(),
    }
  }

  /// 权重选择只接受权重目录下的文件名
  pub fn weights_path(&self, weight: &str) -> Result<PathBuf, ApiError> {
    let plain = !weight.is_empty()
      && !weight.contains(['/', '\\'])
      && !weight.contains("..")
      && Path::new(weight).file_name().is_some();
    if !plain {
      return Err(ApiError::BadRequest(format!("无效的权重文件名: {}", weight)));
    }
    Ok(self.settings.weights_dir.join(weight))
  }

  pub fn pipeline_context(&self) -> PipelineContext {
    PipelineContext {
      transcoder: self.transcoder.clone(),
      publisher: self.publisher.clone(),
      notifier: self.notifier.clone(),
    }
  }

  /// 在阻塞线程中完成初始化
  pub async fn open_pipeline(
    &self,
    request: PipelineRequest,
  ) -> Result<StreamPipeline, ApiError> {
    let backend = self.backend.clone();
    let context = self.pipeline_context();
    tokio::task::spawn_blocking(move || StreamPipeline::open(request, backend.as_ref(), context))
      .await
      .map_err(|e| ApiError::Internal(e.to_string()))?
      .map_err(ApiError::Pipeline)
  }
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/file_names", get(handlers::file_names))
    .route("/predictImg", post(handlers::predict_img))
    .route("/predictVideo", get(handlers::predict_video))
    .route("/predictCamera", get(handlers::predict_camera))
    .route("/stopCamera", get(handlers::stop_camera))
    .route("/ws", get(ws::ws_handler))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(state)
}
