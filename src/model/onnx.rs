// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/model/onnx.rs - 基于 ONNX Runtime 的 YOLOv8 病害检测模型
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
  sync::Mutex,
};

use image::RgbImage;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor,
};
use tracing::info;

use super::{DetectResult, Model, ModelError, postprocess::decode_yolov8};
use crate::frame::to_nchw_f32;

const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_OUTPUT_NAME: &str = "output0";

pub struct YoloOnnxBuilder {
  path: PathBuf,
  input_size: u32,
  output_name: String,
  confidence_threshold: f32,
  nms_threshold: f32,
}

impl YoloOnnxBuilder {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      input_size: DEFAULT_INPUT_SIZE,
      output_name: DEFAULT_OUTPUT_NAME.to_string(),
      confidence_threshold: 0.5,
      nms_threshold: 0.45,
    }
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  pub fn build(self) -> Result<YoloOnnx, ModelError> {
    if !self.path.is_file() {
      return Err(ModelError::WeightsNotFound(self.path.display().to_string()));
    }

    let session = Session::builder()
      .map_err(|e| ModelError::Load(e.to_string()))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(|e| ModelError::Load(e.to_string()))?
      .commit_from_file(&self.path)
      .map_err(|e| ModelError::Load(format!("{}: {}", self.path.display(), e)))?;

    info!(
      "模型加载完成: {} (输入 {}×{}, 置信度阈值 {:.2})",
      self.path.display(),
      self.input_size,
      self.input_size,
      self.confidence_threshold
    );

    Ok(YoloOnnx {
      session: Mutex::new(session),
      input_size: self.input_size,
      output_name: self.output_name,
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
    })
  }
}

/// YOLOv8 目标检测模型
///
/// `Session::run` 需要可变引用，故以互斥锁包裹。
pub struct YoloOnnx {
  session: Mutex<Session>,
  input_size: u32,
  output_name: String,
  confidence_threshold: f32,
  nms_threshold: f32,
}

impl Model for YoloOnnx {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let size = self.input_size as usize;
    let data = to_nchw_f32(input, self.input_size);
    let tensor = Tensor::from_array((vec![1usize, 3, size, size], data.into_boxed_slice()))
      .map_err(|e| ModelError::Inference(format!("无法创建输入张量: {}", e)))?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| ModelError::Inference("模型会话锁已损坏".to_string()))?;
    let outputs = session
      .run(ort::inputs![tensor])
      .map_err(|e| ModelError::Inference(e.to_string()))?;

    let output = outputs
      .get(self.output_name.as_str())
      .ok_or_else(|| ModelError::Inference(format!("缺少输出张量 {}", self.output_name)))?;
    let (shape, data) = output
      .try_extract_tensor::<f32>()
      .map_err(|e| ModelError::Inference(e.to_string()))?;
    let shape: Vec<i64> = shape.iter().copied().collect();

    decode_yolov8(
      data,
      &shape,
      self.input_size,
      self.confidence_threshold,
      self.nms_threshold,
    )
  }
}
