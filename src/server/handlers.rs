// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/server/handlers.rs - 接口处理函数
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
  convert::Infallible,
  path::{Path, PathBuf},
};

use axum::{
  Json,
  body::Body,
  extract::State,
  http::{HeaderName, HeaderValue, header},
  response::{IntoResponse, Response},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use super::{
  ApiError, AppState,
  request::{
    ApiJson, ApiQuery, CameraQuery, ImgResponse, PredictImgBody, StopQuery, StopResponse,
    VideoQuery, WeightItem, WeightList, parse_confidence, record_of,
  },
};
use crate::{
  detector::{DetectionOutcome, Detector, format_elapsed},
  model::ModelError,
  publish::cleanup,
  session::StopOutcome,
  task::{PipelineKind, PipelinePaths, PipelineRequest, SourceSpec, StreamPipeline},
};

pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const SESSION_HEADER: &str = "x-camera-session";

const SUCCESS_MESSAGE: &str = "预测成功";
const UNRECOGNIZED_MESSAGE: &str = "该图片无法识别，请重新上传！";
const LOADING_MESSAGE: &str = "正在加载，请稍等！";

// 推流通道中最多缓存的帧数
const STREAM_BUFFER: usize = 4;

pub async fn file_names(State(state): State<AppState>) -> Json<WeightList> {
  let names = list_files(&state.settings.weights_dir).await;
  Json(WeightList {
    weight_items: names
      .into_iter()
      .map(|name| WeightItem {
        value: name.clone(),
        label: name,
      })
      .collect(),
  })
}

async fn list_files(dir: &Path) -> Vec<String> {
  let mut entries = match tokio::fs::read_dir(dir).await {
    Ok(entries) => entries,
    Err(e) => {
      warn!("无法读取权重目录 {}: {}", dir.display(), e);
      return Vec::new();
    }
  };

  let mut names = Vec::new();
  while let Ok(Some(entry)) = entries.next_entry().await {
    let is_file = entry
      .file_type()
      .await
      .map(|t| t.is_file())
      .unwrap_or(false);
    if is_file {
      names.push(entry.file_name().to_string_lossy().into_owned());
    }
  }
  names.sort();
  names
}

fn remote_url(input: &str) -> Option<Url> {
  Url::parse(input)
    .ok()
    .filter(|url| matches!(url.scheme(), "http" | "https"))
}

pub async fn predict_img(
  State(state): State<AppState>,
  ApiJson(body): ApiJson<PredictImgBody>,
) -> Result<Json<ImgResponse>, ApiError> {
  let confidence = parse_confidence(&body.conf)?;
  let weights = state.weights_path(&body.weight)?;
  let categories = state.catalog.get(&body.kind)?.clone();
  let work_dir = state.settings.work_dir.clone();
  let id = Uuid::new_v4();

  let (input, downloaded) = match remote_url(&body.input_img) {
    Some(url) => {
      let extension = Path::new(url.path())
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jpg".to_string());
      let path = work_dir.join(format!("{}-input.{}", id, extension));
      if let Err(e) = state.publisher.download(url.as_str(), &path).await {
        cleanup(&[&path]);
        return Err(e.into());
      }
      (path, true)
    }
    None => (PathBuf::from(&body.input_img), false),
  };
  let save_path = work_dir.join(format!("result-{}.jpg", id));

  let backend = state.backend.clone();
  let draw = state.draw.clone();
  let (image_path, result_path) = (input.clone(), save_path.clone());
  let predicted = tokio::task::spawn_blocking(move || -> Result<DetectionOutcome, ModelError> {
    let model = backend.load_model(&weights, confidence)?;
    let detector = Detector::new(model, categories, confidence, draw);
    Ok(detector.predict(&image_path, &result_path))
  })
  .await;

  let outcome = match predicted {
    Ok(Ok(outcome)) => Ok(outcome),
    Ok(Err(e)) => Err(ApiError::from(e)),
    Err(e) => Err(ApiError::Internal(e.to_string())),
  };
  let outcome = match outcome {
    Ok(outcome) => outcome,
    Err(e) => {
      if downloaded {
        cleanup(&[&input]);
      }
      return Err(e);
    }
  };

  let response = match &outcome {
    DetectionOutcome::Success(result) => {
      let out_img = state.publisher.upload(&save_path).await;
      info!(
        "图片预测成功: {:?} {:?} ({})",
        result.labels(),
        result.confidences(),
        format_elapsed(result.elapsed)
      );
      ImgResponse {
        request: body,
        status: 200,
        message: SUCCESS_MESSAGE,
        out_img,
        all_time: Some(format_elapsed(result.elapsed)),
        confidence: serde_json::to_string(&result.confidences()).ok(),
        label: serde_json::to_string(&result.labels()).ok(),
      }
    }
    DetectionOutcome::NoDetections { .. } | DetectionOutcome::InferenceError { .. } => {
      info!("图片无法识别: {}", body.input_img);
      ImgResponse {
        request: body,
        status: 400,
        message: UNRECOGNIZED_MESSAGE,
        out_img: None,
        all_time: None,
        confidence: None,
        label: None,
      }
    }
  };

  if downloaded {
    cleanup(&[&input, &save_path]);
  } else {
    cleanup(&[&save_path]);
  }
  Ok(Json(response))
}

pub async fn predict_video(
  State(state): State<AppState>,
  ApiQuery(query): ApiQuery<VideoQuery>,
) -> Result<Response, ApiError> {
  let confidence = parse_confidence(&Value::String(query.conf.clone()))?;
  let weights = state.weights_path(&query.weight)?;
  let categories = state.catalog.get(&query.kind)?.clone();

  let paths = PipelinePaths::for_request(&state.settings.work_dir, Uuid::new_v4(), true);
  let download = paths
    .download
    .clone()
    .ok_or_else(|| ApiError::Internal("缺少下载路径".to_string()))?;
  if let Err(e) = state.publisher.download(&query.input_video, &download).await {
    cleanup(&paths.all());
    return Err(e.into());
  }

  let request = PipelineRequest {
    kind: PipelineKind::Video,
    source: SourceSpec::File(download),
    weights,
    confidence,
    categories,
    draw: state.draw.clone(),
    paths,
    record: record_of(&query),
    camera_fps: state.settings.camera_fps,
    jpeg_quality: state.settings.jpeg_quality,
    cancel: state.sessions.shutdown_token().child_token(),
    session: None,
  };
  let pipeline = state.open_pipeline(request).await?;
  Ok(stream_response(pipeline, None))
}

pub async fn predict_camera(
  State(state): State<AppState>,
  ApiQuery(query): ApiQuery<CameraQuery>,
) -> Result<Response, ApiError> {
  let confidence = parse_confidence(&Value::String(query.conf.clone()))?;
  let weights = state.weights_path(&query.weight)?;
  let categories = state.catalog.get(&query.kind)?.clone();

  let session = state.sessions.begin()?;
  let id = session.id();
  state.notifier.message(LOADING_MESSAGE);

  let request = PipelineRequest {
    kind: PipelineKind::Camera,
    source: SourceSpec::Camera,
    weights,
    confidence,
    categories,
    draw: state.draw.clone(),
    paths: PipelinePaths::for_request(&state.settings.work_dir, id, false),
    record: record_of(&query),
    camera_fps: state.settings.camera_fps,
    jpeg_quality: state.settings.jpeg_quality,
    cancel: session.token(),
    session: Some(session),
  };
  let pipeline = state.open_pipeline(request).await?;
  Ok(stream_response(pipeline, Some(id)))
}

pub async fn stop_camera(
  State(state): State<AppState>,
  ApiQuery(query): ApiQuery<StopQuery>,
) -> Result<Json<StopResponse>, ApiError> {
  match state.sessions.stop(query.session) {
    StopOutcome::Stopped(_) | StopOutcome::Idle => Ok(Json(StopResponse {
      status: 200,
      message: SUCCESS_MESSAGE,
      code: 0,
    })),
    StopOutcome::NotFound => Err(ApiError::SessionNotFound),
  }
}

/// 后台运行流水线，响应体为多段 JPEG 流
fn stream_response(pipeline: StreamPipeline, session: Option<Uuid>) -> Response {
  let (tx, rx) = mpsc::channel(STREAM_BUFFER);
  tokio::spawn(async move {
    let report = pipeline.run(tx).await;
    info!(
      "流水线结束: {:?}，{} 帧，{:?}",
      report.state, report.summary.frames, report.summary.exit
    );
  });

  let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
  let mut response = body.into_response();
  let headers = response.headers_mut();
  headers.insert(
    header::CONTENT_TYPE,
    HeaderValue::from_static(MULTIPART_CONTENT_TYPE),
  );
  headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
  if let Some(id) = session {
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
      headers.insert(HeaderName::from_static(SESSION_HEADER), value);
    }
  }
  response
}
