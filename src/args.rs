// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/args.rs - 服务参数配置
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

use clap::Parser;
use url::Url;

use crate::publish::PublisherEndpoints;

/// Miaojian 作物病害识别服务参数配置
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, env = "MIAOJIAN_HOST", default_value = "0.0.0.0")]
  pub host: String,

  /// 监听端口
  #[arg(long, env = "MIAOJIAN_PORT", default_value_t = 5000)]
  pub port: u16,

  /// 模型权重目录
  #[arg(long, env = "MIAOJIAN_WEIGHTS_DIR", default_value = "./weights", value_name = "DIR")]
  pub weights_dir: PathBuf,

  /// 临时文件目录（下载、中间容器、转码输出、结果图片）
  #[arg(long, env = "MIAOJIAN_WORK_DIR", default_value = "./runs", value_name = "DIR")]
  pub work_dir: PathBuf,

  /// 文件上传接口
  #[arg(
    long,
    env = "MIAOJIAN_UPLOAD_URL",
    default_value = "http://localhost:9999/files/upload"
  )]
  pub upload_url: Url,

  /// 视频记录接口
  #[arg(
    long,
    env = "MIAOJIAN_VIDEO_RECORDS_URL",
    default_value = "http://localhost:9999/videoRecords"
  )]
  pub video_records_url: Url,

  /// 摄像头记录接口
  #[arg(
    long,
    env = "MIAOJIAN_CAMERA_RECORDS_URL",
    default_value = "http://localhost:9999/cameraRecords"
  )]
  pub camera_records_url: Url,

  /// 摄像头设备
  /// 支持格式:
  /// - V4L2: v4l2:///dev/video0
  /// - 文件: file:///path/to/video.mp4 （用于调试）
  #[arg(
    long,
    env = "MIAOJIAN_CAMERA",
    default_value = "v4l2:///dev/video0",
    value_name = "URL"
  )]
  pub camera: Url,

  /// 摄像头录制帧率
  #[arg(long, env = "MIAOJIAN_CAMERA_FPS", default_value_t = 20)]
  pub camera_fps: u32,

  /// ffmpeg 可执行文件
  #[arg(long, env = "MIAOJIAN_FFMPEG", default_value = "ffmpeg")]
  pub ffmpeg: PathBuf,

  /// ffprobe 可执行文件
  #[arg(long, env = "MIAOJIAN_FFPROBE", default_value = "ffprobe")]
  pub ffprobe: PathBuf,

  /// 标签字体（TTF/OTF），未指定时只绘制检测框
  #[arg(long, env = "MIAOJIAN_FONT", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 作物类别表，未指定时使用内置表
  #[arg(long, env = "MIAOJIAN_LABELS", value_name = "FILE")]
  pub labels: Option<PathBuf>,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, env = "MIAOJIAN_NMS_THRESHOLD", default_value_t = 0.45, value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 推流 JPEG 质量 (1 - 100)
  #[arg(
    long,
    env = "MIAOJIAN_JPEG_QUALITY",
    default_value_t = 85,
    value_parser = clap::value_parser!(u8).range(1..=100)
  )]
  pub jpeg_quality: u8,
}

impl Args {
  pub fn endpoints(&self) -> PublisherEndpoints {
    PublisherEndpoints {
      upload: self.upload_url.clone(),
      video_records: self.video_records_url.clone(),
      camera_records: self.camera_records_url.clone(),
    }
  }

  pub fn bind_address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}
