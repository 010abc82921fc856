// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 中间视频容器输出
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

//! # GStreamer 视频容器输出
//!
//! 把标注后的帧编码进 AVI 中间容器，流结束后再由转码器转为交付格式。
//!
//! ## 管道
//!
//! ```text
//! appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink location=<path>
//! ```
//!
//! 需要 `gst-plugins-good`（avimux）与 `gst-plugins-ugly`（x264enc）。
//!
//! ## 基本用法
//!
//! ```no_run
//! use miaojian::output::{ContainerWriter, GStreamerContainerWriter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut writer = GStreamerContainerWriter::create("runs/video/container.avi", 640, 480, 20)?;
//! writer.write_frame(&image::RgbImage::new(640, 480))?;
//! writer.finish()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use image::RgbImage;
use tracing::{info, warn};

use super::{ContainerError, ContainerWriter};

// 等待 EOS 写完文件尾的基础时长，再按已写入帧数放宽
const EOS_TIMEOUT_SECS: u64 = 5;
const EOS_FRAMES_PER_SEC: u64 = 60;
// appsrc 最多缓存的帧数，超出时写入阻塞
const QUEUED_FRAMES: u64 = 8;

fn eos_timeout(frame_count: u64) -> gst::ClockTime {
  gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS + frame_count / EOS_FRAMES_PER_SEC)
}

pub struct GStreamerContainerWriter {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
  fps: u64,
  frame_count: u64,
  finished: bool,
}

impl GStreamerContainerWriter {
  pub fn create(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    fps: u32,
  ) -> Result<Self, ContainerError> {
    let path = path.as_ref();
    let create_error = |reason: String| ContainerError::Create {
      path: path.display().to_string(),
      reason,
    };

    gst::init().map_err(|e| create_error(e.to_string()))?;

    let fps = fps.max(1);
    let pipeline_desc = format!(
      "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux ! filesink location=\"{}\"",
      path.display()
    );
    info!("创建视频容器管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)
      .map_err(|e| create_error(e.to_string()))?
      .downcast::<gst::Pipeline>()
      .map_err(|_| create_error("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or_else(|| create_error("找不到 appsrc 元素".to_string()))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| create_error("无法转换为 appsrc".to_string()))?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", width as i32)
      .field("height", height as i32)
      .field("framerate", gst::Fraction::new(fps as i32, 1))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);
    appsrc.set_block(true);
    appsrc.set_max_bytes(width as u64 * height as u64 * 3 * QUEUED_FRAMES);

    pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| create_error(e.to_string()))?;

    info!(
      "视频容器已打开: {}x{} @ {} fps -> {}",
      width,
      height,
      fps,
      path.display()
    );

    Ok(Self {
      pipeline,
      appsrc,
      width,
      height,
      fps: fps as u64,
      frame_count: 0,
      finished: false,
    })
  }

  fn wait_for_eos(&self) -> Result<(), ContainerError> {
    let Some(bus) = self.pipeline.bus() else {
      return Ok(());
    };
    let timeout = eos_timeout(self.frame_count);
    let message = bus.timed_pop_filtered(timeout, &[gst::MessageType::Eos, gst::MessageType::Error]);
    match message.as_ref().map(|m| m.view()) {
      Some(gst::MessageView::Error(err)) => Err(ContainerError::Write(err.error().to_string())),
      Some(_) => Ok(()),
      // 超时后文件尾可能不完整
      None => Err(ContainerError::Write(format!(
        "等待视频容器结束超时 ({} 秒)",
        timeout.seconds()
      ))),
    }
  }
}

impl ContainerWriter for GStreamerContainerWriter {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), ContainerError> {
    if self.finished {
      return Err(ContainerError::Closed);
    }
    if image.dimensions() != (self.width, self.height) {
      return Err(ContainerError::FrameSize {
        expected: (self.width, self.height),
        actual: image.dimensions(),
      });
    }

    let mut buffer = gst::Buffer::from_slice(image.as_raw().clone());
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or_else(|| ContainerError::Write("缓冲区不可写".to_string()))?;
      let frame_duration = 1_000_000_000 / self.fps;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(self.frame_count * frame_duration));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }
    self.frame_count += 1;

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| ContainerError::Write(format!("推送缓冲区失败: {:?}", e)))?;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), ContainerError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;

    // 发送 EOS 让 avimux 写完索引
    let result = self
      .appsrc
      .end_of_stream()
      .map_err(|e| ContainerError::Write(format!("{:?}", e)))
      .and_then(|_| self.wait_for_eos());

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止视频容器管道失败: {}", e);
    }
    info!("视频容器已关闭，共写入 {} 帧", self.frame_count);
    result
  }
}

impl Drop for GStreamerContainerWriter {
  fn drop(&mut self) {
    if let Err(e) = self.finish() {
      warn!("关闭视频容器失败: {}", e);
    }
  }
}
