// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/publish.rs - 结果上传、记录提交与临时文件清理
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

use reqwest::{
  Client, StatusCode,
  multipart::{Form, Part},
};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum PublishError {
  #[error("网络请求错误: {0}")]
  Http(#[from] reqwest::Error),
  #[error("服务端返回异常状态码: {0}")]
  Status(StatusCode),
  #[error("上传响应中缺少文件地址")]
  MissingUrl,
  #[error("文件读写错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 记录的种类，决定提交到哪个接口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
  Video,
  Camera,
}

/// 下游媒体服务的地址
#[derive(Debug, Clone)]
pub struct PublisherEndpoints {
  pub upload: Url,
  pub video_records: Url,
  pub camera_records: Url,
}

/// 上传结果文件并向下游提交记录
///
/// 网络失败只记录日志，不中断请求。
#[derive(Debug, Clone)]
pub struct ResultPublisher {
  client: Client,
  endpoints: PublisherEndpoints,
}

impl ResultPublisher {
  pub fn new(endpoints: PublisherEndpoints) -> Self {
    Self {
      client: Client::new(),
      endpoints,
    }
  }

  /// 上传本地文件，返回远端地址
  pub async fn upload(&self, path: &Path) -> Option<String> {
    match self.try_upload(path).await {
      Ok(url) => {
        info!("文件上传成功: {} -> {}", path.display(), url);
        Some(url)
      }
      Err(e) => {
        warn!("文件上传失败 {}: {}", path.display(), e);
        None
      }
    }
  }

  async fn try_upload(&self, path: &Path) -> Result<String, PublishError> {
    let content = tokio::fs::read(path).await?;
    let file_name = path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| "upload".to_string());
    let form = Form::new().part("file", Part::bytes(content).file_name(file_name));

    let response = self
      .client
      .post(self.endpoints.upload.clone())
      .multipart(form)
      .send()
      .await?;
    if response.status() != StatusCode::OK {
      return Err(PublishError::Status(response.status()));
    }

    let body: serde_json::Value = response.json().await?;
    match body.get("data") {
      Some(serde_json::Value::String(url)) => Ok(url.clone()),
      Some(serde_json::Value::Null) | None => Err(PublishError::MissingUrl),
      Some(other) => Ok(other.to_string()),
    }
  }

  /// 提交 JSON 记录，成功返回 `true`
  pub async fn publish<T: Serialize>(&self, kind: RecordKind, record: &T) -> bool {
    let endpoint = match kind {
      RecordKind::Video => &self.endpoints.video_records,
      RecordKind::Camera => &self.endpoints.camera_records,
    };
    let result = self
      .client
      .post(endpoint.clone())
      .json(record)
      .send()
      .await
      .map_err(PublishError::from)
      .and_then(|response| match response.status() {
        StatusCode::OK => Ok(()),
        status => Err(PublishError::Status(status)),
      });

    match result {
      Ok(()) => {
        info!("记录已提交: {}", endpoint);
        true
      }
      Err(e) => {
        warn!("记录提交失败 {}: {}", endpoint, e);
        false
      }
    }
  }

  /// 流式下载远端文件到本地
  pub async fn download(&self, url: &str, save_path: &Path) -> Result<u64, PublishError> {
    let mut response = self.client.get(url).send().await?;
    if response.status() != StatusCode::OK {
      return Err(PublishError::Status(response.status()));
    }

    if let Some(parent) = save_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(save_path).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
      file.write_all(&chunk).await?;
      written += chunk.len() as u64;
    }
    file.flush().await?;

    info!("下载完成: {} -> {} ({} 字节)", url, save_path.display(), written);
    Ok(written)
  }
}

/// 删除存在的文件，错误只记录日志
pub fn cleanup<P: AsRef<Path>>(paths: &[P]) {
  for path in paths {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
      Ok(()) => debug!("已删除临时文件: {}", path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!("删除临时文件失败 {}: {}", path.display(), e),
    }
  }
}
