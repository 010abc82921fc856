// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/bin/predict_image.rs - 单张图片离线识别
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;

use miaojian::{
  detector::{Detector, format_elapsed},
  labels::CategoryCatalog,
  model::YoloOnnxBuilder,
  output::draw::Draw,
};

/// 单张图片病害识别
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 权重文件路径
  #[arg(long, value_name = "FILE")]
  pub weights: PathBuf,
  /// 输入图片
  #[arg(long, value_name = "IMAGE")]
  pub image: PathBuf,
  /// 作物种类（rice / corn / strawberry / tomato）
  #[arg(long)]
  pub kind: String,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.25, value_name = "THRESHOLD")]
  pub conf: f32,
  /// 标注结果保存路径
  #[arg(long, default_value = "result.jpg", value_name = "OUTPUT")]
  pub output: PathBuf,
  /// 标签字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
  /// 自定义类别表
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  info!("权重文件: {}", args.weights.display());
  info!("输入图片: {}", args.image.display());
  info!("作物种类: {}", args.kind);

  let catalog = match &args.labels {
    Some(path) => CategoryCatalog::from_file(path)?,
    None => CategoryCatalog::builtin()?,
  };
  let categories = catalog.get(&args.kind)?.clone();
  let draw = match &args.font {
    Some(path) => Draw::with_font_file(path)?,
    None => Draw::default(),
  };
  let model = YoloOnnxBuilder::new(&args.weights)
    .confidence_threshold(args.conf)
    .build()?;

  let detector = Detector::new(Box::new(model), categories, args.conf, draw);
  let outcome = detector.predict(&args.image, &args.output);
  info!("推理完成，耗时: {:.2?}", outcome.elapsed());
  if outcome.is_success() {
    info!("结果已保存: {}", args.output.display());
  }

  let report = json!({
    "labels": outcome.labels(),
    "confidences": outcome.confidences(),
    "allTime": format_elapsed(outcome.elapsed()),
  });
  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(())
}
