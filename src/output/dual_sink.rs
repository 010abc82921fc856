// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/output/dual_sink.rs - 实时流与视频容器双路写入
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

use bytes::{BufMut, Bytes, BytesMut};
use image::{ExtendedColorType, ImageEncoder, RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::{info, warn};

use super::{ContainerError, ContainerWriter};

/// multipart/x-mixed-replace 的分隔符
pub const MULTIPART_BOUNDARY: &str = "frame";

#[derive(Error, Debug)]
pub enum SinkError {
  #[error("JPEG 编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("视频容器错误: {0}")]
  Container(#[from] ContainerError),
  #[error("写入器已释放")]
  Released,
}

/// 把一帧 JPEG 包装成 multipart 分块
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
  let head = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MULTIPART_BOUNDARY);
  let mut chunk = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
  chunk.put_slice(head.as_bytes());
  chunk.put_slice(jpeg);
  chunk.put_slice(b"\r\n");
  chunk.freeze()
}

/// 每帧同时写入实时 JPEG 流和中间视频容器
///
/// JPEG 编码到独立缓冲区后才写容器，两路的帧顺序一致。
/// `release` 只生效一次，`Drop` 时自动调用。
pub struct DualSinkWriter {
  container: Option<Box<dyn ContainerWriter>>,
  jpeg_quality: u8,
  frames_written: u64,
}

impl DualSinkWriter {
  pub fn new(container: Box<dyn ContainerWriter>, jpeg_quality: u8) -> Self {
    Self {
      container: Some(container),
      jpeg_quality: jpeg_quality.clamp(1, 100),
      frames_written: 0,
    }
  }

  pub fn frames_written(&self) -> u64 {
    self.frames_written
  }

  pub fn is_released(&self) -> bool {
    self.container.is_none()
  }

  /// 写入一帧，返回可直接发送给客户端的分块
  pub fn write(&mut self, frame: &RgbImage) -> Result<Bytes, SinkError> {
    let container = self.container.as_mut().ok_or(SinkError::Released)?;

    let mut jpeg = Vec::with_capacity((frame.width() * frame.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality).write_image(
      frame.as_raw(),
      frame.width(),
      frame.height(),
      ExtendedColorType::Rgb8,
    )?;

    container.write_frame(frame)?;
    self.frames_written += 1;
    Ok(multipart_chunk(&jpeg))
  }

  /// 释放视频容器，重复调用无副作用
  pub fn release(&mut self) -> Result<(), SinkError> {
    match self.container.take() {
      Some(mut container) => {
        info!("释放视频写入器，共写入 {} 帧", self.frames_written);
        container.finish()?;
        Ok(())
      }
      None => Ok(()),
    }
  }
}

impl Drop for DualSinkWriter {
  fn drop(&mut self) {
    if let Err(e) = self.release() {
      warn!("释放视频写入器失败: {}", e);
    }
  }
}
