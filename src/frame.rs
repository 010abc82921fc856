// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/frame.rs - 帧数据结构
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

use image::{RgbImage, imageops::FilterType};

/// 流水线统一使用的输出宽度
pub const CANONICAL_WIDTH: u32 = 640;
/// 流水线统一使用的输出高度
pub const CANONICAL_HEIGHT: u32 = 480;

/// 一帧解码后的图像
#[derive(Debug, Clone)]
pub struct Frame {
  pub image: RgbImage,
  pub index: u64,
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }

  /// 缩放到 640×480，尺寸已一致时原样返回
  pub fn into_canonical(self) -> Self {
    if self.image.width() == CANONICAL_WIDTH && self.image.height() == CANONICAL_HEIGHT {
      return self;
    }
    let image = image::imageops::resize(
      &self.image,
      CANONICAL_WIDTH,
      CANONICAL_HEIGHT,
      FilterType::Triangle,
    );
    Self { image, ..self }
  }
}

/// RGB 图像转为归一化的 NCHW 浮点张量数据
///
/// 先拉伸到 `size × size`，像素值缩放到 `[0, 1]`。
pub fn to_nchw_f32(image: &RgbImage, size: u32) -> Vec<f32> {
  let resized = if image.width() == size && image.height() == size {
    image.clone()
  } else {
    image::imageops::resize(image, size, size, FilterType::Triangle)
  };

  let plane = (size * size) as usize;
  let mut data = vec![0f32; plane * 3];
  for (x, y, pixel) in resized.enumerate_pixels() {
    let idx = (y * size + x) as usize;
    data[idx] = pixel[0] as f32 / 255.0;
    data[plane + idx] = pixel[1] as f32 / 255.0;
    data[2 * plane + idx] = pixel[2] as f32 / 255.0;
  }
  data
}
