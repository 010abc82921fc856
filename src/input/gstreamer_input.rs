// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入实现
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

//! # GStreamer 帧来源
//!
//! 两种来源共用一条 `appsink` 管道，统一输出 640×480 的 RGB 帧：
//!
//! - 视频文件：`file:///path/to/video.mp4`
//! - 摄像头（V4L2）：`v4l2:///dev/video0`
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-libav
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use miaojian::{FromUrl, input::{FrameSource, GStreamerFrameSource}};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("file:///tmp/field.mp4")?;
//! let source = GStreamerFrameSource::from_url(&url)?;
//! println!("fps: {:?}", source.fps());
//! for frame in source {
//!   let frame = frame?;
//!   println!("第 {} 帧", frame.index);
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{error, info, warn};
use url::Url;

use super::{FrameSource, FrameSourceError, OpenError, SourceKind};
use crate::{
  FromUrl,
  frame::{CANONICAL_HEIGHT, CANONICAL_WIDTH, Frame},
};

// 等待管道进入播放状态的最长时间
const OPEN_TIMEOUT_SECS: u64 = 10;

pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource { device: String, fps: u32 },
  Scale { width: u32, height: u32 },
  TargetFormat { format: String },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location=\"{}\" ! decodebin", path)
      }
      GStreamerInputBuilderItem::CameraSource { device, fps } => {
        format!(
          "v4l2src device={} ! videorate ! video/x-raw,framerate={}/1",
          device, fps
        )
      }
      GStreamerInputBuilderItem::Scale { width, height } => {
        format!(
          "videoscale ! video/x-raw,width={},height={},pixel-aspect-ratio=1/1",
          width, height
        )
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 帧来源
///
/// 文件来源不丢帧，摄像头来源只保留最新的两帧。
pub struct GStreamerFrameSource {
  kind: SourceKind,
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  fps: Option<f64>,
  frame_count: Option<u64>,
  next_index: u64,
}

impl GStreamerFrameSource {
  pub fn open_file(path: impl AsRef<Path>) -> Result<Self, OpenError> {
    let path = path.as_ref();
    if !path.is_file() {
      return Err(OpenError::NotFound(path.display().to_string()));
    }
    let location = path.display().to_string();
    let items = [
      GStreamerInputBuilderItem::FileSource(location.clone()),
      GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      },
      GStreamerInputBuilderItem::Scale {
        width: CANONICAL_WIDTH,
        height: CANONICAL_HEIGHT,
      },
    ];
    Self::launch(
      SourceKind::File,
      &location,
      &items,
      "appsink name=sink sync=false max-buffers=4 drop=false",
    )
    .map_err(|reason| OpenError::Pipeline { location, reason })
  }

  pub fn open_camera(device: &str, fps: u32) -> Result<Self, OpenError> {
    let items = [
      GStreamerInputBuilderItem::CameraSource {
        device: device.to_string(),
        fps,
      },
      GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      },
      GStreamerInputBuilderItem::Scale {
        width: CANONICAL_WIDTH,
        height: CANONICAL_HEIGHT,
      },
    ];
    Self::launch(
      SourceKind::Live,
      device,
      &items,
      "appsink name=sink max-buffers=2 drop=true",
    )
    .map_err(|reason| OpenError::Device {
      device: device.to_string(),
      reason,
    })
  }

  fn launch(
    kind: SourceKind,
    location: &str,
    items: &[GStreamerInputBuilderItem],
    sink: &str,
  ) -> Result<Self, String> {
    gst::init().map_err(|e| e.to_string())?;

    let basic_pipeline = items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let full_pipeline = format!("{} ! {}", basic_pipeline, sink);
    info!("GStreamer 输入管道: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)
      .map_err(|e| e.to_string())?
      .downcast::<gst::Pipeline>()
      .map_err(|_| "无法创建管道".to_string())?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or_else(|| "找不到 appsink 元素".to_string())?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| "无法转换为 appsink".to_string())?;

    // 打开失败（文件损坏、设备被占用）在状态切换时暴露
    let opened = pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| e.to_string())
      .and_then(|_| {
        let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(OPEN_TIMEOUT_SECS));
        result.map(|_| ()).map_err(|e| e.to_string())
      });
    if let Err(reason) = opened {
      let _ = pipeline.set_state(gst::State::Null);
      return Err(bus_error(&pipeline).unwrap_or(reason));
    }

    let (fps, frame_count) = match kind {
      SourceKind::File => probe_file(&pipeline, &appsink),
      SourceKind::Live => (None, None),
    };
    info!(
      "输入已打开: {} (fps: {:?}, 总帧数: {:?})",
      location, fps, frame_count
    );

    Ok(Self {
      kind,
      pipeline,
      appsink,
      fps,
      frame_count,
      next_index: 0,
    })
  }
}

/// 从总线上取出最近的错误描述
fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
  let bus = pipeline.bus()?;
  let message = bus.pop_filtered(&[gst::MessageType::Error])?;
  match message.view() {
    gst::MessageView::Error(err) => Some(err.error().to_string()),
    _ => None,
  }
}

/// 查询已协商的帧率与时长
fn probe_file(pipeline: &gst::Pipeline, appsink: &gst_app::AppSink) -> (Option<f64>, Option<u64>) {
  let fps = appsink
    .static_pad("sink")
    .and_then(|pad| pad.current_caps())
    .and_then(|caps| gst_video::VideoInfo::from_caps(&caps).ok())
    .map(|info| info.fps())
    .filter(|fps| fps.numer() > 0 && fps.denom() > 0)
    .map(|fps| fps.numer() as f64 / fps.denom() as f64);

  let duration = pipeline.query_duration::<gst::ClockTime>();
  let frame_count = match (fps, duration) {
    (Some(fps), Some(duration)) => Some((duration.seconds_f64() * fps).round() as u64),
    _ => None,
  };
  (fps, frame_count)
}

impl FromUrl for GStreamerFrameSource {
  type Error = OpenError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "file" => Self::open_file(url.path()),
      "v4l2" => {
        let fps = url
          .query_pairs()
          .find(|(k, _)| k == "fps")
          .and_then(|(_, v)| v.parse::<u32>().ok())
          .unwrap_or(20);
        Self::open_camera(url.path(), fps)
      }
      _ => Err(OpenError::Unsupported(url.to_string())),
    }
  }
}

impl Drop for GStreamerFrameSource {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 输入管道失败: {}", e);
    }
  }
}

impl FrameSource for GStreamerFrameSource {
  fn kind(&self) -> SourceKind {
    self.kind
  }

  fn fps(&self) -> Option<f64> {
    self.fps
  }

  fn frame_count(&self) -> Option<u64> {
    self.frame_count
  }
}

impl Iterator for GStreamerFrameSource {
  type Item = Result<Frame, FrameSourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    // EOS 或管道出错时 pull_sample 返回错误，视为来源耗尽
    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) => {
        if let Some(reason) = bus_error(&self.pipeline) {
          error!("输入管道错误: {}", reason);
          return Some(Err(FrameSourceError::Read(reason)));
        }
        return None;
      }
    };

    let index = self.next_index;
    self.next_index += 1;
    Some(convert_sample(&sample, index))
  }
}

fn convert_sample(sample: &gst::Sample, index: u64) -> Result<Frame, FrameSourceError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| FrameSourceError::Read("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| FrameSourceError::Read("样本中没有 caps".to_string()))?;
  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| FrameSourceError::Read("无法从 caps 获取视频信息".to_string()))?;

  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(FrameSourceError::UnsupportedFormat);
  }

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| FrameSourceError::Read(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * height.saturating_sub(1) + width * 3;
  if height == 0 || data.len() < expected {
    return Err(FrameSourceError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 去掉每行末尾的对齐填充
  let mut pixels = Vec::with_capacity(width * height * 3);
  for row in 0..height {
    let start = row * stride;
    pixels.extend_from_slice(&data[start..start + width * 3]);
  }

  let image = image::RgbImage::from_raw(width as u32, height as u32, pixels).ok_or(
    FrameSourceError::BufferSizeMismatch {
      expected: width * height * 3,
      actual: 0,
    },
  )?;
  let timestamp_ms = buffer.pts().map(|pts| pts.mseconds()).unwrap_or(0);

  Ok(Frame::new(image, index, timestamp_ms))
}
