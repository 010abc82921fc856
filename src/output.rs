// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/output.rs - 输出模块
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

use image::RgbImage;
use thiserror::Error;

/// 中间视频容器写入器
///
/// `finish` 可重复调用，第二次起为空操作。
pub trait ContainerWriter: Send {
  fn write_frame(&mut self, image: &RgbImage) -> Result<(), ContainerError>;
  fn finish(&mut self) -> Result<(), ContainerError>;
}

#[derive(Error, Debug)]
pub enum ContainerError {
  #[error("无法创建视频容器 {path}: {reason}")]
  Create { path: String, reason: String },
  #[error("帧尺寸不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  FrameSize {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("视频容器写入错误: {0}")]
  Write(String),
  #[error("视频容器已关闭")]
  Closed,
}

pub mod draw;

mod dual_sink;
pub use self::dual_sink::{DualSinkWriter, MULTIPART_BOUNDARY, SinkError, multipart_chunk};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::GStreamerContainerWriter;
