// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/server/request.rs - 接口请求与响应
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

use axum::extract::{FromRequest, FromRequestParts};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::ApiError;

/// 查询参数，解析失败时同样返回 `{status,message,code}`
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// JSON 请求体
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, Clone, Serialize)]
pub struct WeightItem {
  pub value: String,
  pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightList {
  pub weight_items: Vec<WeightItem>,
}

/// `/predictImg` 请求体，原样回显在响应中
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictImgBody {
  #[serde(default)]
  pub username: String,
  pub weight: String,
  /// 数字或数字字符串
  pub conf: Value,
  #[serde(default)]
  pub start_time: String,
  pub input_img: String,
  pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImgResponse {
  #[serde(flatten)]
  pub request: PredictImgBody,
  pub status: u16,
  pub message: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub out_img: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub all_time: Option<String>,
  /// JSON 编码后的置信度列表
  #[serde(skip_serializing_if = "Option::is_none")]
  pub confidence: Option<String>,
  /// JSON 编码后的标签列表
  #[serde(skip_serializing_if = "Option::is_none")]
  pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoQuery {
  #[serde(default)]
  pub username: String,
  pub weight: String,
  pub conf: String,
  #[serde(default)]
  pub start_time: String,
  pub input_video: String,
  pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraQuery {
  #[serde(default)]
  pub username: String,
  pub weight: String,
  pub kind: String,
  pub conf: String,
  #[serde(default)]
  pub start_time: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopQuery {
  pub session: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
  pub status: u16,
  pub message: &'static str,
  pub code: u8,
}

/// 置信度阈值，接受数字或数字字符串
pub fn parse_confidence(conf: &Value) -> Result<f32, ApiError> {
  let value = match conf {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse::<f64>().ok(),
    _ => None,
  };
  match value {
    Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => Ok(v as f32),
    _ => Err(ApiError::BadRequest(format!("无效的置信度: {}", conf))),
  }
}

/// 请求参数转为下游记录
pub fn record_of<T: Serialize>(query: &T) -> Map<String, Value> {
  match serde_json::to_value(query) {
    Ok(Value::Object(map)) => map,
    _ => Map::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_confidence() {
    assert_eq!(parse_confidence(&json!(0.25)).unwrap(), 0.25);
    assert_eq!(parse_confidence(&json!(" 0.5")).unwrap(), 0.5);
    assert_eq!(parse_confidence(&json!(1)).unwrap(), 1.0);
    assert!(parse_confidence(&json!("abc")).is_err());
    assert!(parse_confidence(&json!(1.5)).is_err());
    assert!(parse_confidence(&json!(null)).is_err());
  }

  #[test]
  fn test_video_record_fields() {
    let query = VideoQuery {
      username: "farmer".into(),
      weight: "corn.onnx".into(),
      conf: "0.5".into(),
      start_time: "2026-10-19 08:00:00".into(),
      input_video: "http://media/in.mp4".into(),
      kind: "corn".into(),
    };
    let record = record_of(&query);
    let mut keys: Vec<&str> = record.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(
      keys,
      vec!["conf", "inputVideo", "kind", "startTime", "username", "weight"]
    );
  }

  #[test]
  fn test_img_response_omits_missing_fields() {
    let response = ImgResponse {
      request: PredictImgBody {
        username: "farmer".into(),
        weight: "rice.onnx".into(),
        conf: json!("0.4"),
        start_time: "t".into(),
        input_img: "leaf.jpg".into(),
        kind: "rice".into(),
      },
      status: 400,
      message: "该图片无法识别，请重新上传！",
      out_img: None,
      all_time: None,
      confidence: None,
      label: None,
    };
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["inputImg"], "leaf.jpg");
    assert_eq!(value["conf"], "0.4");
    assert_eq!(value["status"], 400);
    assert!(value.get("outImg").is_none());
    assert!(value.get("label").is_none());
  }
}
