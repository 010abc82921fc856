// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/backend.rs - 媒体与模型后端
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

use std::path::Path;

use crate::{
  input::{FrameSource, OpenError},
  model::{ModelError, ModelHandle},
  output::{ContainerError, ContainerWriter},
};

/// 流水线依赖的本地能力：加载模型、打开来源、创建中间容器
pub trait MediaBackend: Send + Sync {
  fn load_model(&self, weights: &Path, confidence: f32) -> Result<ModelHandle, ModelError>;

  fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, OpenError>;

  fn open_camera(&self) -> Result<Box<dyn FrameSource>, OpenError>;

  fn create_container(
    &self,
    path: &Path,
    width: u32,
    height: u32,
    fps: u32,
  ) -> Result<Box<dyn ContainerWriter>, ContainerError>;
}

#[cfg(all(
  feature = "gstreamer_input",
  feature = "gstreamer_output",
  feature = "model_onnx"
))]
mod native {
  use std::path::Path;

  use url::Url;

  use super::MediaBackend;
  use crate::{
    FromUrl,
    input::{FrameSource, GStreamerFrameSource, OpenError},
    model::{ModelError, ModelHandle, YoloOnnxBuilder},
    output::{ContainerError, ContainerWriter, GStreamerContainerWriter},
  };

  /// GStreamer 编解码 + ONNX Runtime 推理
  pub struct NativeBackend {
    camera: Url,
    camera_fps: u32,
    nms_threshold: f32,
  }

  impl NativeBackend {
    pub fn new(camera: Url, camera_fps: u32, nms_threshold: f32) -> Self {
      Self {
        camera,
        camera_fps,
        nms_threshold,
      }
    }
  }

  impl MediaBackend for NativeBackend {
    fn load_model(&self, weights: &Path, confidence: f32) -> Result<ModelHandle, ModelError> {
      let model = YoloOnnxBuilder::new(weights)
        .confidence_threshold(confidence)
        .nms_threshold(self.nms_threshold)
        .build()?;
      Ok(Box::new(model))
    }

    fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, OpenError> {
      Ok(Box::new(GStreamerFrameSource::open_file(path)?))
    }

    fn open_camera(&self) -> Result<Box<dyn FrameSource>, OpenError> {
      match self.camera.scheme() {
        "v4l2" => Ok(Box::new(GStreamerFrameSource::open_camera(
          self.camera.path(),
          self.camera_fps,
        )?)),
        _ => Ok(Box::new(GStreamerFrameSource::from_url(&self.camera)?)),
      }
    }

    fn create_container(
      &self,
      path: &Path,
      width: u32,
      height: u32,
      fps: u32,
    ) -> Result<Box<dyn ContainerWriter>, ContainerError> {
      Ok(Box::new(GStreamerContainerWriter::create(
        path, width, height, fps,
      )?))
    }
  }
}

#[cfg(all(
  feature = "gstreamer_input",
  feature = "gstreamer_output",
  feature = "model_onnx"
))]
pub use self::native::NativeBackend;
