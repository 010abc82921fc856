// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/server/error.rs - 接口错误
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

use axum::{
  Json,
  extract::rejection::{JsonRejection, QueryRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::{
  labels::LabelError, model::ModelError, publish::PublishError, session::SessionError,
  task::PipelineError,
};

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("{0}")]
  BadRequest(String),
  #[error("请求参数无效: {0}")]
  Query(#[from] QueryRejection),
  #[error("请求体无效: {0}")]
  Json(#[from] JsonRejection),
  #[error("{0}")]
  Label(#[from] LabelError),
  #[error("{0}")]
  Model(#[from] ModelError),
  #[error("{0}")]
  Pipeline(PipelineError),
  #[error("文件下载失败: {0}")]
  Download(#[from] PublishError),
  #[error("摄像头正在使用中")]
  Busy(#[from] SessionError),
  #[error("摄像头会话不存在")]
  SessionNotFound,
  #[error("服务内部错误: {0}")]
  Internal(String),
}

impl ApiError {
  fn status_code(&self) -> StatusCode {
    match self {
      ApiError::BadRequest(_)
      | ApiError::Query(_)
      | ApiError::Json(_)
      | ApiError::Label(_)
      | ApiError::Model(_)
      | ApiError::Pipeline(_)
      | ApiError::Download(_) => StatusCode::BAD_REQUEST,
      ApiError::Busy(_) => StatusCode::CONFLICT,
      ApiError::SessionNotFound => StatusCode::NOT_FOUND,
      ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

#[derive(Serialize)]
struct ErrorBody {
  status: u16,
  message: String,
  code: u8,
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    warn!("请求失败 ({}): {}", status, self);
    let body = ErrorBody {
      status: status.as_u16(),
      message: self.to_string(),
      code: 1,
    };
    (status, Json(body)).into_response()
  }
}
