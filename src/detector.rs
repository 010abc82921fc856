// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/detector.rs - 病害检测器
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
  path::Path,
  time::{Duration, Instant},
};

use image::{ImageReader, RgbImage};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
  labels::{CategorySet, LabelError},
  model::{DetectItem, ModelHandle},
  output::draw::{Annotation, Draw},
};

/// 识别失败时的标签
pub const FAILED_LABEL: &str = "预测失败";
/// 识别失败时的置信度
pub const FAILED_CONFIDENCE: &str = "0.00%";

/// 置信度格式化为两位小数的百分比
pub fn format_confidence(confidence: f32) -> String {
  format!("{:.2}%", confidence * 100.0)
}

/// 耗时格式化为 `"1.234秒"`
pub fn format_elapsed(elapsed: Duration) -> String {
  format!("{:.3}秒", elapsed.as_secs_f64())
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDetection {
  pub class_id: u32,
  pub label: String,
  pub confidence: f32,
  pub bbox: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
  pub detections: Vec<LabeledDetection>,
  pub elapsed: Duration,
}

impl DetectionResult {
  pub fn labels(&self) -> Vec<String> {
    self.detections.iter().map(|d| d.label.clone()).collect()
  }

  pub fn confidences(&self) -> Vec<String> {
    self
      .detections
      .iter()
      .map(|d| format_confidence(d.confidence))
      .collect()
  }
}

/// 一次推理的结果
///
/// 没有检测到目标和推理出错都是正常结果，不作为错误向上传播。
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
  Success(DetectionResult),
  NoDetections { elapsed: Duration },
  InferenceError { reason: String, elapsed: Duration },
}

/// 列表或失败占位值
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReportField {
  List(Vec<String>),
  Sentinel(&'static str),
}

impl DetectionOutcome {
  pub fn elapsed(&self) -> Duration {
    match self {
      DetectionOutcome::Success(result) => result.elapsed,
      DetectionOutcome::NoDetections { elapsed } => *elapsed,
      DetectionOutcome::InferenceError { elapsed, .. } => *elapsed,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, DetectionOutcome::Success(_))
  }

  pub fn labels(&self) -> ReportField {
    match self {
      DetectionOutcome::Success(result) => ReportField::List(result.labels()),
      _ => ReportField::Sentinel(FAILED_LABEL),
    }
  }

  pub fn confidences(&self) -> ReportField {
    match self {
      DetectionOutcome::Success(result) => ReportField::List(result.confidences()),
      _ => ReportField::Sentinel(FAILED_CONFIDENCE),
    }
  }
}

/// 模型、类别表与绘制器的组合
pub struct Detector {
  model: ModelHandle,
  categories: CategorySet,
  threshold: f32,
  draw: Draw,
}

impl Detector {
  pub fn new(model: ModelHandle, categories: CategorySet, threshold: f32, draw: Draw) -> Self {
    Self {
      model,
      categories,
      threshold: threshold.clamp(0.0, 1.0),
      draw,
    }
  }

  /// 推理一帧，返回标注后的图像与结果
  pub fn infer(&self, frame: &RgbImage) -> (RgbImage, DetectionOutcome) {
    let start = Instant::now();
    let mut annotated = frame.clone();

    let items = match self.model.infer(frame) {
      Ok(result) => result.items,
      Err(e) => {
        warn!("推理失败: {}", e);
        let outcome = DetectionOutcome::InferenceError {
          reason: e.to_string(),
          elapsed: start.elapsed(),
        };
        return (annotated, outcome);
      }
    };

    let detections = match self.label_items(&items) {
      Ok(detections) => detections,
      Err(e) => {
        warn!("类别映射失败: {}", e);
        let outcome = DetectionOutcome::InferenceError {
          reason: e.to_string(),
          elapsed: start.elapsed(),
        };
        return (annotated, outcome);
      }
    };

    if detections.is_empty() {
      let outcome = DetectionOutcome::NoDetections {
        elapsed: start.elapsed(),
      };
      return (annotated, outcome);
    }

    let annotations: Vec<Annotation<'_>> = detections
      .iter()
      .map(|d| Annotation {
        class_id: d.class_id,
        label: &d.label,
        score: d.confidence,
        bbox: d.bbox,
      })
      .collect();
    self.draw.draw_annotations(&mut annotated, &annotations);

    let result = DetectionResult {
      detections,
      elapsed: start.elapsed(),
    };
    debug!("检测到 {} 个目标，耗时 {:.2?}", result.detections.len(), result.elapsed);
    (annotated, DetectionOutcome::Success(result))
  }

  /// 单张图片推理，成功时把标注结果写入 `save_path`
  pub fn predict(&self, image_path: &Path, save_path: &Path) -> DetectionOutcome {
    let start = Instant::now();
    let image = match read_rgb_image(image_path) {
      Ok(image) => image,
      Err(e) => {
        warn!("无法读取图片 {}: {}", image_path.display(), e);
        return DetectionOutcome::InferenceError {
          reason: e.to_string(),
          elapsed: start.elapsed(),
        };
      }
    };

    let (annotated, outcome) = self.infer(&image);
    if !outcome.is_success() {
      return outcome;
    }

    let saved = save_path
      .parent()
      .map(std::fs::create_dir_all)
      .unwrap_or(Ok(()))
      .map_err(image::ImageError::IoError)
      .and_then(|_| annotated.save(save_path));
    match saved {
      Ok(()) => outcome,
      Err(e) => {
        warn!("无法保存结果图片 {}: {}", save_path.display(), e);
        DetectionOutcome::InferenceError {
          reason: e.to_string(),
          elapsed: outcome.elapsed(),
        }
      }
    }
  }

  // 低于阈值或零分的结果在此再过滤一次
  fn label_items(&self, items: &[DetectItem]) -> Result<Vec<LabeledDetection>, LabelError> {
    items
      .iter()
      .filter(|item| item.score > 0.0 && item.score >= self.threshold)
      .map(|item| -> Result<LabeledDetection, LabelError> {
        let label = self.categories.label(item.class_id)?;
        Ok(LabeledDetection {
          class_id: item.class_id,
          label: label.to_string(),
          confidence: item.score.min(1.0),
          bbox: item.bbox,
        })
      })
      .collect()
  }
}

fn read_rgb_image(path: &Path) -> Result<RgbImage, image::ImageError> {
  Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?.to_rgb8())
}
