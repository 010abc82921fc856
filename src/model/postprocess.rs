// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/model/postprocess.rs - YOLOv8 输出解码与非极大值抑制
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

use std::cmp::Ordering;

use super::{DetectItem, DetectResult, ModelError};

/// 解码 YOLOv8 的 `[1, 4 + nc, N]` 输出
///
/// 每个候选框前四行为输入像素坐标下的 `cx, cy, w, h`，其余为各类别分数。
/// 输出框归一化到 `[0, 1]`。
pub fn decode_yolov8(
  data: &[f32],
  shape: &[i64],
  input_size: u32,
  confidence_threshold: f32,
  nms_threshold: f32,
) -> Result<DetectResult, ModelError> {
  if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 || shape[2] <= 0 {
    return Err(ModelError::OutputShape(shape.to_vec()));
  }
  let rows = shape[1] as usize;
  let candidates = shape[2] as usize;
  if data.len() < rows * candidates {
    return Err(ModelError::OutputShape(shape.to_vec()));
  }

  let at = |row: usize, col: usize| data[row * candidates + col];
  let size = input_size as f32;

  let mut items = Vec::new();
  for col in 0..candidates {
    // 找到最高类别分数
    let mut best_score = 0f32;
    let mut best_class = 0u32;
    for class in 0..rows - 4 {
      let score = at(4 + class, col);
      if score > best_score {
        best_score = score;
        best_class = class as u32;
      }
    }
    // 零分候选不算检测结果
    if best_score <= 0.0 || best_score < confidence_threshold {
      continue;
    }

    let (cx, cy, w, h) = (at(0, col), at(1, col), at(2, col), at(3, col));
    let bbox = [
      ((cx - w / 2.0) / size).clamp(0.0, 1.0),
      ((cy - h / 2.0) / size).clamp(0.0, 1.0),
      ((cx + w / 2.0) / size).clamp(0.0, 1.0),
      ((cy + h / 2.0) / size).clamp(0.0, 1.0),
    ];
    items.push(DetectItem {
      class_id: best_class,
      score: best_score.min(1.0),
      bbox,
    });
  }

  Ok(DetectResult {
    items: nms(items, nms_threshold).into_boxed_slice(),
  })
}

/// 按类别进行非极大值抑制
pub fn nms(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  // 按置信度降序排序
  items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

  let mut result: Vec<DetectItem> = Vec::new();
  for item in items {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == item.class_id && iou(&kept.bbox, &item.bbox) >= iou_threshold);
    if !suppressed {
      result.push(item);
    }
  }
  result
}

/// 计算两个边界框的 IoU
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}
