// 该文件是 Miaojian （苗鉴） 项目的一部分。
// tests/common/mod.rs - 集成测试公共组件
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

#![allow(dead_code)]

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use axum::{Router, body::Body, http::Request};
use futures_util::{StreamExt, stream};
use image::{Rgb, RgbImage};
use serde_json::json;
use tempfile::TempDir;
use url::Url;
use wiremock::{
  Mock, MockServer, ResponseTemplate,
  matchers::{method, path},
};

use miaojian::{
  backend::MediaBackend,
  frame::Frame,
  input::{FrameSource, FrameSourceError, OpenError, SourceKind},
  labels::CategoryCatalog,
  model::{DetectItem, DetectResult, Model, ModelError, ModelHandle},
  output::{ContainerError, ContainerWriter, draw::Draw},
  publish::{PublisherEndpoints, ResultPublisher},
  server::{AppState, ServerSettings, router},
  transcode::{ProgressStream, Transcode, TranscodeError},
};

pub const UPLOADED_URL: &str = "http://media.local/files/out.mp4";

/// 固定输出的模型
pub struct FakeModel {
  items: Vec<DetectItem>,
}

impl Model for FakeModel {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, _input: &RgbImage) -> Result<DetectResult, ModelError> {
    Ok(DetectResult {
      items: self.items.clone().into_boxed_slice(),
    })
  }
}

/// 合成帧来源，`limit` 为空时模拟摄像头
pub struct SyntheticSource {
  limit: Option<u64>,
  next: u64,
  interval: Duration,
}

impl Iterator for SyntheticSource {
  type Item = Result<Frame, FrameSourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.limit.is_some_and(|limit| self.next >= limit) {
      return None;
    }
    if !self.interval.is_zero() {
      std::thread::sleep(self.interval);
    }
    let index = self.next;
    self.next += 1;
    let image = RgbImage::from_pixel(320, 240, Rgb([40, (index % 255) as u8, 90]));
    Some(Ok(Frame::new(image, index, index * 50)))
  }
}

impl FrameSource for SyntheticSource {
  fn kind(&self) -> SourceKind {
    if self.limit.is_some() {
      SourceKind::File
    } else {
      SourceKind::Live
    }
  }

  fn fps(&self) -> Option<f64> {
    Some(20.0)
  }

  fn frame_count(&self) -> Option<u64> {
    self.limit
  }
}

/// 把帧数写进文件的容器
pub struct CountingContainer {
  path: PathBuf,
  frames: u64,
}

impl ContainerWriter for CountingContainer {
  fn write_frame(&mut self, _image: &RgbImage) -> Result<(), ContainerError> {
    self.frames += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), ContainerError> {
    std::fs::write(&self.path, self.frames.to_string())
      .map_err(|e| ContainerError::Write(e.to_string()))
  }
}

pub struct FakeBackend {
  pub items: Vec<DetectItem>,
  pub video_frames: u64,
  pub camera_interval: Duration,
}

impl Default for FakeBackend {
  fn default() -> Self {
    Self {
      items: vec![DetectItem {
        class_id: 3,
        score: 0.93,
        bbox: [0.2, 0.2, 0.7, 0.8],
      }],
      video_frames: 6,
      camera_interval: Duration::from_millis(5),
    }
  }
}

impl MediaBackend for FakeBackend {
  fn load_model(&self, weights: &Path, _confidence: f32) -> Result<ModelHandle, ModelError> {
    if !weights.is_file() {
      return Err(ModelError::WeightsNotFound(weights.display().to_string()));
    }
    Ok(Box::new(FakeModel {
      items: self.items.clone(),
    }))
  }

  fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, OpenError> {
    if !path.is_file() {
      return Err(OpenError::NotFound(path.display().to_string()));
    }
    Ok(Box::new(SyntheticSource {
      limit: Some(self.video_frames),
      next: 0,
      interval: Duration::ZERO,
    }))
  }

  fn open_camera(&self) -> Result<Box<dyn FrameSource>, OpenError> {
    Ok(Box::new(SyntheticSource {
      limit: None,
      next: 0,
      interval: self.camera_interval,
    }))
  }

  fn create_container(
    &self,
    path: &Path,
    _width: u32,
    _height: u32,
    _fps: u32,
  ) -> Result<Box<dyn ContainerWriter>, ContainerError> {
    Ok(Box::new(CountingContainer {
      path: path.to_path_buf(),
      frames: 0,
    }))
  }
}

/// 复制文件并给出固定进度
pub struct FakeTranscoder;

impl Transcode for FakeTranscoder {
  fn transcode(&self, input: &Path, output: &Path) -> Result<ProgressStream, TranscodeError> {
    if !input.exists() {
      return Err(TranscodeError::InputMissing(input.display().to_string()));
    }
    std::fs::copy(input, output)?;
    Ok(stream::iter([Ok(50.0), Ok(100.0)]).boxed())
  }
}

pub struct TestApp {
  pub state: AppState,
  pub router: Router,
  pub media: MockServer,
  pub weights_dir: TempDir,
  pub work_dir: TempDir,
}

impl TestApp {
  pub async fn new() -> Self {
    Self::with_backend(FakeBackend::default()).await
  }

  pub async fn with_backend(backend: FakeBackend) -> Self {
    let media = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/files/upload"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": UPLOADED_URL})))
      .mount(&media)
      .await;
    for records in ["/videoRecords", "/cameraRecords"] {
      Mock::given(method("POST"))
        .and(path(records))
        .respond_with(ResponseTemplate::new(200))
        .mount(&media)
        .await;
    }

    let weights_dir = tempfile::tempdir().unwrap();
    std::fs::write(weights_dir.path().join("corn.onnx"), b"weights").unwrap();
    std::fs::write(weights_dir.path().join("best.onnx"), b"weights").unwrap();
    std::fs::create_dir(weights_dir.path().join("archive")).unwrap();
    let work_dir = tempfile::tempdir().unwrap();

    let base = Url::parse(&media.uri()).unwrap();
    let publisher = ResultPublisher::new(PublisherEndpoints {
      upload: base.join("/files/upload").unwrap(),
      video_records: base.join("/videoRecords").unwrap(),
      camera_records: base.join("/cameraRecords").unwrap(),
    });
    let settings = ServerSettings {
      weights_dir: weights_dir.path().to_path_buf(),
      work_dir: work_dir.path().to_path_buf(),
      camera_fps: 20,
      jpeg_quality: 80,
    };
    let state = AppState::new(
      settings,
      Arc::new(backend),
      Arc::new(FakeTranscoder),
      publisher,
      CategoryCatalog::builtin().unwrap(),
      Draw::default(),
    );

    Self {
      router: router(state.clone()),
      state,
      media,
      weights_dir,
      work_dir,
    }
  }

  /// 在工作目录中写一张测试图片
  pub fn sample_image(&self) -> PathBuf {
    let path = self.weights_dir.path().join("leaf.png");
    RgbImage::from_pixel(64, 64, Rgb([30, 140, 50]))
      .save(&path)
      .unwrap();
    path
  }

  /// 工作目录中残留的文件
  pub fn leftovers(&self) -> Vec<PathBuf> {
    walk(self.work_dir.path())
  }

  pub async fn records(&self, endpoint: &str) -> Vec<serde_json::Value> {
    self
      .media
      .received_requests()
      .await
      .unwrap()
      .into_iter()
      .filter(|r| r.url.path() == endpoint)
      .map(|r| serde_json::from_slice(&r.body).unwrap())
      .collect()
  }
}

fn walk(dir: &Path) -> Vec<PathBuf> {
  let mut files = Vec::new();
  if let Ok(entries) = std::fs::read_dir(dir) {
    for entry in entries.flatten() {
      let path = entry.path();
      if path.is_dir() {
        files.extend(walk(&path));
      } else {
        files.push(path);
      }
    }
  }
  files
}

pub fn get(uri: &str) -> Request<Body> {
  Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
  Request::builder()
    .method("POST")
    .uri(uri)
    .header("content-type", "application/json")
    .body(Body::from(body.to_string()))
    .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
  let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
    .await
    .unwrap();
  serde_json::from_slice(&bytes).unwrap()
}
