// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/notify.rs - 推送通知广播
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

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// 推送给 WebSocket 客户端的一条事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub event: &'static str,
  pub data: Value,
}

impl Notification {
  pub fn message(text: impl Into<String>) -> Self {
    Self {
      event: "message",
      data: json!({ "data": text.into() }),
    }
  }

  pub fn progress(percent: f64) -> Self {
    Self {
      event: "progress",
      data: json!({ "data": percent }),
    }
  }
}

/// 向所有已连接的客户端广播通知
///
/// 没有订阅者时发送的事件直接丢弃。
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
  fn default() -> Self {
    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }
}

impl Notifier {
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }

  pub fn send(&self, notification: Notification) {
    trace!("推送事件: {:?}", notification);
    let _ = self.tx.send(notification);
  }

  pub fn message(&self, text: impl Into<String>) {
    self.send(Notification::message(text));
  }

  pub fn progress(&self, percent: f64) {
    self.send(Notification::progress(percent));
  }
}
