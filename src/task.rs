// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/task.rs - 推流推理任务
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

//! 视频与摄像头共用的推流任务。
//!
//! 状态依次为 `Init → Streaming → Finalizing → Done`，`Init` 中任何打开失败
//! 都进入 `Failed` 并在发送任何数据之前返回给调用方。`Streaming` 以任何方式
//! 结束（来源耗尽、取消、客户端断开、出错甚至 panic）都会释放来源与写入器，
//! 然后进入 `Finalizing`：转码、上传、提交记录、删除临时文件。

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
  backend::MediaBackend,
  detector::{DetectionOutcome, Detector},
  frame::{CANONICAL_HEIGHT, CANONICAL_WIDTH},
  input::{FrameSource, OpenError},
  labels::CategorySet,
  model::ModelError,
  notify::Notifier,
  output::{ContainerError, DualSinkWriter, draw::Draw},
  publish::{RecordKind, ResultPublisher, cleanup},
  session::CameraSession,
  transcode::{Transcode, TranscodeError},
};

/// 转码开始前推送的提示
pub const SAVING_MESSAGE: &str = "处理完成，正在保存！";
/// 转码失败时推送的提示
pub const SAVE_FAILED_MESSAGE: &str = "视频保存失败！";

// 无法探测帧率时的容器帧率
const FALLBACK_FPS: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
  Video,
  Camera,
}

impl PipelineKind {
  fn record_kind(self) -> RecordKind {
    match self {
      PipelineKind::Video => RecordKind::Video,
      PipelineKind::Camera => RecordKind::Camera,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Init,
  Streaming,
  Finalizing,
  Done,
  Failed,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("{0}")]
  Open(#[from] OpenError),
  #[error("{0}")]
  Model(#[from] ModelError),
  #[error("{0}")]
  Container(#[from] ContainerError),
  #[error("工作目录不可用: {0}")]
  WorkDir(#[from] std::io::Error),
}

/// 帧来源
#[derive(Debug, Clone)]
pub enum SourceSpec {
  File(PathBuf),
  Camera,
}

/// 一次请求用到的临时文件
#[derive(Debug, Clone)]
pub struct PipelinePaths {
  pub download: Option<PathBuf>,
  pub container: PathBuf,
  pub output: PathBuf,
}

impl PipelinePaths {
  pub fn for_request(work_dir: &Path, id: Uuid, with_download: bool) -> Self {
    let dir = work_dir.join("video");
    Self {
      download: with_download.then(|| dir.join(format!("{}-download.mp4", id))),
      container: dir.join(format!("{}-container.avi", id)),
      output: dir.join(format!("{}-output.mp4", id)),
    }
  }

  pub fn all(&self) -> Vec<&Path> {
    self
      .download
      .iter()
      .map(PathBuf::as_path)
      .chain([self.container.as_path(), self.output.as_path()])
      .collect()
  }
}

/// 收尾阶段用到的协作者
#[derive(Clone)]
pub struct PipelineContext {
  pub transcoder: Arc<dyn Transcode>,
  pub publisher: ResultPublisher,
  pub notifier: Notifier,
}

/// 打开流水线所需的全部参数
pub struct PipelineRequest {
  pub kind: PipelineKind,
  pub source: SourceSpec,
  pub weights: PathBuf,
  pub confidence: f32,
  pub categories: CategorySet,
  pub draw: Draw,
  pub paths: PipelinePaths,
  /// 提交给下游的记录，收尾时补上 `outVideo`
  pub record: Map<String, Value>,
  pub camera_fps: u32,
  pub jpeg_quality: u8,
  pub cancel: CancellationToken,
  pub session: Option<CameraSession>,
}

/// 推流阶段的退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
  Exhausted,
  Cancelled,
  ClientGone,
  SourceError,
  SinkError,
  Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
  pub frames: u64,
  pub exit: StreamExit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
  pub state: PipelineState,
  pub summary: StreamSummary,
  pub output_url: Option<String>,
  pub transcode_error: Option<String>,
}

fn enter(kind: PipelineKind, state: PipelineState) {
  info!("[{:?}] 流水线状态 -> {:?}", kind, state);
}

struct StreamingStage {
  kind: PipelineKind,
  source: Box<dyn FrameSource>,
  detector: Detector,
  sink: DualSinkWriter,
  cancel: CancellationToken,
}

impl StreamingStage {
  /// 逐帧推理并写入双路输出，`emit` 返回 `false` 表示客户端已断开
  fn run<F: FnMut(Bytes) -> bool>(mut self, mut emit: F) -> StreamSummary {
    let mut frames = 0u64;
    let exit = loop {
      if self.cancel.is_cancelled() {
        break StreamExit::Cancelled;
      }
      let frame = match self.source.next() {
        None => break StreamExit::Exhausted,
        Some(Err(e)) => {
          warn!("读取帧失败: {}", e);
          break StreamExit::SourceError;
        }
        Some(Ok(frame)) => frame.into_canonical(),
      };

      let (annotated, outcome) = self.detector.infer(&frame.image);
      match &outcome {
        DetectionOutcome::Success(result) => debug!(
          "第 {} 帧: {:?} {:?}",
          frame.index,
          result.labels(),
          result.confidences()
        ),
        DetectionOutcome::NoDetections { .. } => debug!("第 {} 帧: 未检测到目标", frame.index),
        DetectionOutcome::InferenceError { reason, .. } => {
          warn!("第 {} 帧推理失败: {}", frame.index, reason)
        }
      }

      // 推理期间收到停止请求时不再写入
      if self.cancel.is_cancelled() {
        break StreamExit::Cancelled;
      }
      let chunk = match self.sink.write(&annotated) {
        Ok(chunk) => chunk,
        Err(e) => {
          error!("写入帧失败: {}", e);
          break StreamExit::SinkError;
        }
      };
      frames += 1;
      if !emit(chunk) {
        break StreamExit::ClientGone;
      }
    };

    info!("[{:?}] 推流结束: {:?}，共 {} 帧", self.kind, exit, frames);
    if let Err(e) = self.sink.release() {
      warn!("释放视频写入器失败: {}", e);
    }
    StreamSummary { frames, exit }
  }
}

struct Finalizer {
  kind: PipelineKind,
  paths: PipelinePaths,
  record: Map<String, Value>,
  context: PipelineContext,
  session: Option<CameraSession>,
}

impl Finalizer {
  async fn run(mut self, summary: StreamSummary) -> PipelineReport {
    enter(self.kind, PipelineState::Finalizing);
    self.context.notifier.message(SAVING_MESSAGE);

    let transcoded = self.transcode().await;
    let output_url = match &transcoded {
      Ok(()) => self.context.publisher.upload(&self.paths.output).await,
      Err(e) => {
        error!("[{:?}] 转码失败: {}", self.kind, e);
        self.context.notifier.message(SAVE_FAILED_MESSAGE);
        None
      }
    };
    if let Some(url) = &output_url {
      self
        .record
        .insert("outVideo".to_string(), Value::String(url.clone()));
    }

    self
      .context
      .publisher
      .publish(self.kind.record_kind(), &self.record)
      .await;
    cleanup(&self.paths.all());

    // 摄像头登记位在此归还
    drop(self.session.take());
    enter(self.kind, PipelineState::Done);

    PipelineReport {
      state: PipelineState::Done,
      summary,
      output_url,
      transcode_error: transcoded.err().map(|e| e.to_string()),
    }
  }

  async fn transcode(&self) -> Result<(), TranscodeError> {
    let mut progress = self
      .context
      .transcoder
      .transcode(&self.paths.container, &self.paths.output)?;
    while let Some(event) = progress.next().await {
      self.context.notifier.progress(event?);
    }
    Ok(())
  }
}

/// 已完成初始化、等待推流的流水线
pub struct StreamPipeline {
  streaming: StreamingStage,
  finalizer: Finalizer,
}

impl StreamPipeline {
  /// 初始化：打开来源、加载模型、创建写入器
  ///
  /// 会阻塞，需在阻塞线程中调用。失败时删除已下载的文件。
  pub fn open(
    request: PipelineRequest,
    backend: &dyn MediaBackend,
    context: PipelineContext,
  ) -> Result<Self, PipelineError> {
    enter(request.kind, PipelineState::Init);
    let (source, detector, sink) = match Self::acquire(&request, backend) {
      Ok(resources) => resources,
      Err(e) => {
        error!("[{:?}] 初始化失败: {}", request.kind, e);
        enter(request.kind, PipelineState::Failed);
        cleanup(&request.paths.all());
        return Err(e);
      }
    };

    Ok(Self {
      streaming: StreamingStage {
        kind: request.kind,
        source,
        detector,
        sink,
        cancel: request.cancel,
      },
      finalizer: Finalizer {
        kind: request.kind,
        paths: request.paths,
        record: request.record,
        context,
        session: request.session,
      },
    })
  }

  fn acquire(
    request: &PipelineRequest,
    backend: &dyn MediaBackend,
  ) -> Result<(Box<dyn FrameSource>, Detector, DualSinkWriter), PipelineError> {
    if let Some(dir) = request.paths.container.parent() {
      std::fs::create_dir_all(dir)?;
    }

    let source = match &request.source {
      SourceSpec::File(path) => backend.open_file(path)?,
      SourceSpec::Camera => backend.open_camera()?,
    };

    let model = backend.load_model(&request.weights, request.confidence)?;
    let detector = Detector::new(
      model,
      request.categories.clone(),
      request.confidence,
      request.draw.clone(),
    );

    let fps = match request.kind {
      PipelineKind::Camera => request.camera_fps,
      PipelineKind::Video => source
        .fps()
        .map(|fps| fps.round() as u32)
        .filter(|fps| *fps > 0)
        .unwrap_or(FALLBACK_FPS),
    };
    let container = backend.create_container(
      &request.paths.container,
      CANONICAL_WIDTH,
      CANONICAL_HEIGHT,
      fps,
    )?;

    Ok((
      source,
      detector,
      DualSinkWriter::new(container, request.jpeg_quality),
    ))
  }

  /// 推流并收尾，`chunks` 在收尾完成后才关闭
  pub async fn run(self, chunks: mpsc::Sender<Bytes>) -> PipelineReport {
    let StreamPipeline {
      streaming,
      finalizer,
    } = self;
    let kind = streaming.kind;
    enter(kind, PipelineState::Streaming);

    let joined = tokio::task::spawn_blocking(move || {
      let summary = streaming.run(|chunk| chunks.blocking_send(chunk).is_ok());
      (summary, chunks)
    })
    .await;

    match joined {
      Ok((summary, chunks)) => {
        let report = finalizer.run(summary).await;
        drop(chunks);
        report
      }
      Err(e) => {
        // panic 时来源与写入器已随栈展开释放
        error!("[{:?}] 推流线程异常退出: {}", kind, e);
        let summary = StreamSummary {
          frames: 0,
          exit: StreamExit::Panicked,
        };
        finalizer.run(summary).await
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use futures_util::stream;
  use image::{Rgb, RgbImage};
  use serde_json::json;
  use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
  };

  use super::*;
  use crate::{
    frame::Frame,
    input::{FrameSourceError, SourceKind},
    labels::CategoryCatalog,
    model::{DetectItem, DetectResult, Model, ModelHandle},
    output::ContainerWriter,
    publish::PublisherEndpoints,
    transcode::ProgressStream,
  };

  struct SyntheticSource {
    kind: SourceKind,
    remaining: Option<u64>,
    next: u64,
    fail_at: Option<u64>,
    pulled: Arc<Mutex<u64>>,
  }

  impl Iterator for SyntheticSource {
    type Item = Result<Frame, FrameSourceError>;

    fn next(&mut self) -> Option<Self::Item> {
      if let Some(remaining) = self.remaining.as_mut() {
        if *remaining == 0 {
          return None;
        }
        *remaining -= 1;
      }
      *self.pulled.lock().unwrap() += 1;
      if self.fail_at == Some(self.next) {
        return Some(Err(FrameSourceError::Read("decoder stalled".to_string())));
      }
      let index = self.next;
      self.next += 1;
      let image = RgbImage::from_pixel(320, 240, Rgb([(index * 10) as u8, 80, 40]));
      Some(Ok(Frame::new(image, index, index * 50)))
    }
  }

  impl FrameSource for SyntheticSource {
    fn kind(&self) -> SourceKind {
      self.kind
    }

    fn fps(&self) -> Option<f64> {
      Some(20.0)
    }

    fn frame_count(&self) -> Option<u64> {
      self.remaining
    }
  }

  struct MemoryContainer {
    frames: Arc<Mutex<Vec<(u32, u32)>>>,
    finished: Arc<Mutex<u32>>,
    path: PathBuf,
    fail_writes: bool,
  }

  impl ContainerWriter for MemoryContainer {
    fn write_frame(&mut self, image: &RgbImage) -> Result<(), ContainerError> {
      if self.fail_writes {
        return Err(ContainerError::Write("disk full".to_string()));
      }
      self.frames.lock().unwrap().push(image.dimensions());
      Ok(())
    }

    fn finish(&mut self) -> Result<(), ContainerError> {
      *self.finished.lock().unwrap() += 1;
      std::fs::write(&self.path, b"avi").map_err(|e| ContainerError::Write(e.to_string()))
    }
  }

  struct HealthyModel;

  impl Model for HealthyModel {
    type Input = RgbImage;
    type Output = DetectResult;
    type Error = ModelError;

    fn infer(&self, _input: &RgbImage) -> Result<DetectResult, ModelError> {
      Ok(DetectResult {
        items: vec![DetectItem {
          class_id: 3,
          score: 0.93,
          bbox: [0.1, 0.1, 0.4, 0.4],
        }]
        .into_boxed_slice(),
      })
    }
  }

  struct PanickingModel;

  impl Model for PanickingModel {
    type Input = RgbImage;
    type Output = DetectResult;
    type Error = ModelError;

    fn infer(&self, _input: &RgbImage) -> Result<DetectResult, ModelError> {
      panic!("inference kernel crashed");
    }
  }

  #[derive(Default)]
  struct FakeBackend {
    frames: Option<u64>,
    fail_open: bool,
    source_fails_at: Option<u64>,
    fail_writes: bool,
    panic_model: bool,
    written: Arc<Mutex<Vec<(u32, u32)>>>,
    finished: Arc<Mutex<u32>>,
    pulled: Arc<Mutex<u64>>,
  }

  impl MediaBackend for FakeBackend {
    fn load_model(&self, _weights: &Path, _confidence: f32) -> Result<ModelHandle, ModelError> {
      if self.panic_model {
        return Ok(Box::new(PanickingModel));
      }
      Ok(Box::new(HealthyModel))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, OpenError> {
      if self.fail_open {
        return Err(OpenError::NotFound(path.display().to_string()));
      }
      Ok(Box::new(SyntheticSource {
        kind: SourceKind::File,
        remaining: self.frames,
        next: 0,
        fail_at: self.source_fails_at,
        pulled: self.pulled.clone(),
      }))
    }

    fn open_camera(&self) -> Result<Box<dyn FrameSource>, OpenError> {
      Ok(Box::new(SyntheticSource {
        kind: SourceKind::Live,
        remaining: None,
        next: 0,
        fail_at: self.source_fails_at,
        pulled: self.pulled.clone(),
      }))
    }

    fn create_container(
      &self,
      path: &Path,
      _width: u32,
      _height: u32,
      _fps: u32,
    ) -> Result<Box<dyn ContainerWriter>, ContainerError> {
      Ok(Box::new(MemoryContainer {
        frames: self.written.clone(),
        finished: self.finished.clone(),
        path: path.to_path_buf(),
        fail_writes: self.fail_writes,
      }))
    }
  }

  struct CopyTranscoder;

  impl Transcode for CopyTranscoder {
    fn transcode(&self, input: &Path, output: &Path) -> Result<ProgressStream, TranscodeError> {
      std::fs::copy(input, output)?;
      Ok(stream::iter([Ok(40.0), Ok(80.0), Ok(100.0)]).boxed())
    }
  }

  /// 输出一段进度后以非零退出码失败
  struct FailingTranscoder;

  impl Transcode for FailingTranscoder {
    fn transcode(&self, _input: &Path, _output: &Path) -> Result<ProgressStream, TranscodeError> {
      Ok(stream::iter([Ok(30.0), Err(TranscodeError::Failed { code: Some(1) })]).boxed())
    }
  }

  fn request(
    kind: PipelineKind,
    work_dir: &Path,
    cancel: CancellationToken,
  ) -> PipelineRequest {
    let categories = CategoryCatalog::builtin().unwrap().get("corn").unwrap().clone();
    let paths = PipelinePaths::for_request(work_dir, Uuid::new_v4(), kind == PipelineKind::Video);
    let source = match &paths.download {
      Some(download) => {
        std::fs::create_dir_all(download.parent().unwrap()).unwrap();
        std::fs::write(download, b"mp4").unwrap();
        SourceSpec::File(download.clone())
      }
      None => SourceSpec::Camera,
    };
    let mut record = Map::new();
    record.insert("username".to_string(), json!("farmer"));
    PipelineRequest {
      kind,
      source,
      weights: PathBuf::from("corn.onnx"),
      confidence: 0.5,
      categories,
      draw: Draw::default(),
      paths,
      record,
      camera_fps: 20,
      jpeg_quality: 80,
      cancel,
      session: None,
    }
  }

  async fn context(server: &MockServer) -> PipelineContext {
    context_with(server, Arc::new(CopyTranscoder)).await
  }

  async fn context_with(server: &MockServer, transcoder: Arc<dyn Transcode>) -> PipelineContext {
    Mock::given(method("POST"))
      .and(path("/files/upload"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "http://media/out.mp4"})))
      .mount(server)
      .await;
    Mock::given(method("POST"))
      .and(path("/videoRecords"))
      .respond_with(ResponseTemplate::new(200))
      .mount(server)
      .await;
    Mock::given(method("POST"))
      .and(path("/cameraRecords"))
      .respond_with(ResponseTemplate::new(200))
      .mount(server)
      .await;
    let base = url::Url::parse(&server.uri()).unwrap();
    PipelineContext {
      transcoder,
      publisher: ResultPublisher::new(PublisherEndpoints {
        upload: base.join("/files/upload").unwrap(),
        video_records: base.join("/videoRecords").unwrap(),
        camera_records: base.join("/cameraRecords").unwrap(),
      }),
      notifier: Notifier::default(),
    }
  }

  // 打开一条视频流水线并读完全部输出
  async fn drive(backend: &FakeBackend, dir: &Path, server: &MockServer) -> (PipelineReport, usize, PipelinePaths) {
    let request = request(PipelineKind::Video, dir, CancellationToken::new());
    let paths = request.paths.clone();
    let pipeline = StreamPipeline::open(request, backend, context(server).await).unwrap();
    let (tx, mut rx) = mpsc::channel(2);
    let handle = tokio::spawn(pipeline.run(tx));
    let mut chunks = 0;
    while rx.recv().await.is_some() {
      chunks += 1;
    }
    (handle.await.unwrap(), chunks, paths)
  }

  async fn published(server: &MockServer) -> Vec<(String, Value)> {
    server
      .received_requests()
      .await
      .unwrap()
      .into_iter()
      .map(|r| {
        let body = serde_json::from_slice(&r.body).unwrap_or(Value::Null);
        (r.url.path().to_string(), body)
      })
      .collect()
  }

  fn stage(backend: &FakeBackend, live: bool, cancel: CancellationToken) -> StreamingStage {
    let categories = CategoryCatalog::builtin().unwrap().get("corn").unwrap().clone();
    let dir = std::env::temp_dir().join(format!("miaojian-stage-{}.avi", Uuid::new_v4()));
    let source = if live {
      backend.open_camera().unwrap()
    } else {
      backend.open_file(Path::new("synthetic.mp4")).unwrap()
    };
    let container = backend.create_container(&dir, 640, 480, 20).unwrap();
    StreamingStage {
      kind: PipelineKind::Camera,
      source,
      detector: Detector::new(Box::new(HealthyModel), categories, 0.5, Draw::default()),
      sink: DualSinkWriter::new(container, 80),
      cancel,
    }
  }

  #[test]
  fn test_file_source_runs_to_exhaustion() {
    let backend = FakeBackend {
      frames: Some(5),
      ..Default::default()
    };
    let mut chunks = 0;
    let summary = stage(&backend, false, CancellationToken::new()).run(|_| {
      chunks += 1;
      true
    });
    assert_eq!(summary, StreamSummary { frames: 5, exit: StreamExit::Exhausted });
    assert_eq!(chunks, 5);
    assert_eq!(*backend.finished.lock().unwrap(), 1);
    // 所有帧统一为 640×480
    assert!(backend.written.lock().unwrap().iter().all(|d| *d == (640, 480)));
  }

  #[test]
  fn test_cancellation_stops_within_one_frame() {
    let backend = FakeBackend::default();
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let mut chunks = 0;
    let summary = stage(&backend, true, cancel).run(|_| {
      chunks += 1;
      if chunks == 3 {
        stopper.cancel();
      }
      true
    });
    assert_eq!(summary, StreamSummary { frames: 3, exit: StreamExit::Cancelled });
    assert_eq!(*backend.pulled.lock().unwrap(), 3);
    assert_eq!(*backend.finished.lock().unwrap(), 1);
  }

  #[test]
  fn test_client_disconnect_releases() {
    let backend = FakeBackend::default();
    let summary = stage(&backend, true, CancellationToken::new()).run(|_| false);
    assert_eq!(summary, StreamSummary { frames: 1, exit: StreamExit::ClientGone });
    assert_eq!(*backend.finished.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_open_failure_cleans_download() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let backend = FakeBackend {
      fail_open: true,
      ..Default::default()
    };
    let request = request(PipelineKind::Video, dir.path(), CancellationToken::new());
    let download = request.paths.download.clone().unwrap();
    assert!(download.exists());

    let result = StreamPipeline::open(request, &backend, context(&server).await);
    assert!(matches!(result, Err(PipelineError::Open(OpenError::NotFound(_)))));
    assert!(!download.exists());
  }

  #[tokio::test]
  async fn test_video_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let backend = FakeBackend {
      frames: Some(4),
      ..Default::default()
    };
    let context = context(&server).await;
    let mut events = context.notifier.subscribe();
    let request = request(PipelineKind::Video, dir.path(), CancellationToken::new());
    let paths = request.paths.clone();

    let pipeline = StreamPipeline::open(request, &backend, context).unwrap();
    let (tx, mut rx) = mpsc::channel(2);
    let handle = tokio::spawn(pipeline.run(tx));

    let mut received = Vec::new();
    while let Some(chunk) = rx.recv().await {
      received.push(chunk);
    }
    let report = handle.await.unwrap();

    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|c| c.starts_with(b"--frame\r\n")));
    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.summary.exit, StreamExit::Exhausted);
    assert_eq!(report.output_url.as_deref(), Some("http://media/out.mp4"));
    assert!(paths.all().iter().all(|p| !p.exists()));

    let mut progress = Vec::new();
    while let Ok(event) = events.try_recv() {
      if event.event == "progress" {
        progress.push(event.data["data"].as_f64().unwrap());
      } else {
        assert_eq!(event.data["data"], SAVING_MESSAGE);
      }
    }
    assert_eq!(progress, vec![40.0, 80.0, 100.0]);

    let requests = server.received_requests().await.unwrap();
    let record = requests
      .iter()
      .find(|r| r.url.path() == "/videoRecords")
      .unwrap();
    let record: Value = serde_json::from_slice(&record.body).unwrap();
    assert_eq!(record["username"], "farmer");
    assert_eq!(record["outVideo"], "http://media/out.mp4");
  }

  #[tokio::test]
  async fn test_camera_pipeline_stops_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let backend = FakeBackend::default();
    let cancel = CancellationToken::new();
    let request = request(PipelineKind::Camera, dir.path(), cancel.clone());

    let pipeline = StreamPipeline::open(request, &backend, context(&server).await).unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    let handle = tokio::spawn(pipeline.run(tx));

    for _ in 0..3 {
      assert!(rx.recv().await.is_some());
    }
    cancel.cancel();
    while rx.recv().await.is_some() {}
    let report = handle.await.unwrap();

    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.summary.exit, StreamExit::Cancelled);
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().any(|r| r.url.path() == "/cameraRecords"));
  }

  #[test]
  fn test_source_error_releases() {
    let backend = FakeBackend {
      frames: Some(10),
      source_fails_at: Some(2),
      ..Default::default()
    };
    let summary = stage(&backend, false, CancellationToken::new()).run(|_| true);
    assert_eq!(summary, StreamSummary { frames: 2, exit: StreamExit::SourceError });
    assert_eq!(*backend.finished.lock().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_transcode_failure_publishes_without_video() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let context = context_with(&server, Arc::new(FailingTranscoder)).await;
    let mut events = context.notifier.subscribe();
    let request = request(PipelineKind::Video, dir.path(), CancellationToken::new());
    let paths = request.paths.clone();
    std::fs::write(&paths.container, b"avi").unwrap();

    let finalizer = Finalizer {
      kind: PipelineKind::Video,
      paths: request.paths,
      record: request.record,
      context,
      session: None,
    };
    let summary = StreamSummary {
      frames: 2,
      exit: StreamExit::Exhausted,
    };
    let report = finalizer.run(summary).await;

    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.output_url, None);
    assert!(report.transcode_error.is_some());

    let mut notifications = Vec::new();
    while let Ok(event) = events.try_recv() {
      notifications.push(json!({"event": event.event, "data": event.data}));
    }
    assert_eq!(
      notifications,
      vec![
        json!({"event": "message", "data": {"data": SAVING_MESSAGE}}),
        json!({"event": "progress", "data": {"data": 30.0}}),
        json!({"event": "message", "data": {"data": SAVE_FAILED_MESSAGE}}),
      ]
    );

    // 不上传，只提交记录
    let requests = published(&server).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "/videoRecords");
    assert_eq!(requests[0].1["username"], "farmer");
    assert!(requests[0].1.get("outVideo").is_none());
    assert!(paths.all().iter().all(|p| !p.exists()));
  }

  #[tokio::test]
  async fn test_source_error_still_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let backend = FakeBackend {
      frames: Some(10),
      source_fails_at: Some(3),
      ..Default::default()
    };
    let (report, chunks, paths) = drive(&backend, dir.path(), &server).await;

    assert_eq!(chunks, 3);
    assert_eq!(report.summary, StreamSummary { frames: 3, exit: StreamExit::SourceError });
    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(report.output_url.as_deref(), Some("http://media/out.mp4"));
    assert_eq!(*backend.finished.lock().unwrap(), 1);
    assert!(paths.all().iter().all(|p| !p.exists()));
  }

  #[tokio::test]
  async fn test_sink_error_still_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let backend = FakeBackend {
      frames: Some(10),
      fail_writes: true,
      ..Default::default()
    };
    let (report, chunks, paths) = drive(&backend, dir.path(), &server).await;

    assert_eq!(chunks, 0);
    assert_eq!(report.summary, StreamSummary { frames: 0, exit: StreamExit::SinkError });
    assert_eq!(report.state, PipelineState::Done);
    assert_eq!(*backend.finished.lock().unwrap(), 1);
    let requests = published(&server).await;
    assert!(requests.iter().any(|(path, _)| path == "/videoRecords"));
    assert!(paths.all().iter().all(|p| !p.exists()));
  }

  #[tokio::test]
  async fn test_panicking_model_still_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let backend = FakeBackend {
      frames: Some(10),
      panic_model: true,
      ..Default::default()
    };
    let (report, chunks, paths) = drive(&backend, dir.path(), &server).await;

    assert_eq!(chunks, 0);
    assert_eq!(report.summary.exit, StreamExit::Panicked);
    assert_eq!(report.state, PipelineState::Done);
    // 写入器随栈展开释放
    assert_eq!(*backend.finished.lock().unwrap(), 1);
    let requests = published(&server).await;
    assert!(requests.iter().any(|(path, _)| path == "/videoRecords"));
    assert!(paths.all().iter().all(|p| !p.exists()));
  }
}
