// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/input.rs - 帧来源
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

use thiserror::Error;

use crate::frame::Frame;

/// 帧来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  /// 已下载的视频文件，读完即止
  File,
  /// 摄像头，直到外部取消
  Live,
}

/// 逐帧产出图像的来源
///
/// 迭代返回 `None` 表示来源已耗尽。
pub trait FrameSource: Iterator<Item = Result<Frame, FrameSourceError>> + Send {
  fn kind(&self) -> SourceKind;
  /// 来源帧率，无法确定时为 `None`
  fn fps(&self) -> Option<f64>;
  /// 文件总帧数，无法确定时为 `None`
  fn frame_count(&self) -> Option<u64>;
}

/// 打开来源时的错误，发生在开始推流之前
#[derive(Error, Debug)]
pub enum OpenError {
  #[error("视频文件不存在: {0}")]
  NotFound(String),
  #[error("无法打开摄像头 {device}: {reason}")]
  Device { device: String, reason: String },
  #[error("无法打开视频 {location}: {reason}")]
  Pipeline { location: String, reason: String },
  #[error("不支持的输入地址: {0}")]
  Unsupported(String),
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
  #[error("读取帧失败: {0}")]
  Read(String),
  #[error("不支持的视频格式")]
  UnsupportedFormat,
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
}

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerFrameSource, GStreamerInputBuilderItem};
