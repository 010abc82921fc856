// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/output/draw.rs - 检测结果绘制
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;

// 按类别编号循环取色
const PALETTE: [[u8; 3]; 8] = [
  [255, 56, 56],
  [255, 157, 151],
  [255, 112, 31],
  [255, 178, 29],
  [72, 249, 10],
  [26, 147, 52],
  [0, 194, 255],
  [52, 69, 147],
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 待绘制的一个检测框
pub struct Annotation<'a> {
  pub class_id: u32,
  pub label: &'a str,
  pub score: f32,
  pub bbox: [f32; 4],
}

/// 检测框绘制器
///
/// 没有字体时只画边框，不画标签文字。
#[derive(Clone, Default)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
}

impl Draw {
  pub fn with_font_file(path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)?;
    info!("标签字体已加载: {}", path.display());
    Ok(Self {
      font: Some(font),
      font_size: LABEL_FONT_SIZE,
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_of(class_id: u32) -> [u8; 3] {
    PALETTE[class_id as usize % PALETTE.len()]
  }

  pub fn draw_annotations(&self, image: &mut RgbImage, annotations: &[Annotation<'_>]) {
    for annotation in annotations {
      self.draw_bbox_with_label(image, annotation);
    }
  }

  // bbox 为归一化坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, annotation: &Annotation<'_>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }
    let bbox = &annotation.bbox;
    let color = Rgb(Self::color_of(annotation.class_id));

    let x_min = ((bbox[0] * w as f32).floor() as i32).clamp(0, w - 1);
    let y_min = ((bbox[1] * h as f32).floor() as i32).clamp(0, h - 1);
    let x_max = ((bbox[2] * w as f32).ceil() as i32).clamp(0, w - 1);
    let y_max = ((bbox[3] * h as f32).ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 内缩嵌套的空心矩形加粗边框
    for t in 0..BOX_THICKNESS {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", annotation.label, annotation.score);
    let scale = PxScale::from(self.font_size);
    let (text_width, text_height) = text_size(scale, font, &label);
    let plate_height = text_height as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;

    // 标签放在边框上方，空间不足时放在框内
    let label_x = x_min;
    let label_y = if y_min >= plate_height {
      y_min - plate_height
    } else {
      y_min
    };
    let plate_width = (text_width as i32).min(w - label_x);
    if plate_width <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(plate_width as u32, plate_height as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      Rgb([255, 255, 255]),
      label_x,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      scale,
      font,
      &label,
    );
  }
}
