// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/server/ws.rs - WebSocket 推送通道
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
  extract::{
    State,
    ws::{Message, WebSocket, WebSocketUpgrade},
  },
  response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AppState;
use crate::notify::Notification;

const GREETING: &str = "Connected to WebSocket server!";

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
  let events = state.notifier.subscribe();
  let shutdown = state.sessions.shutdown_token();
  ws.on_upgrade(move |socket| relay(socket, events, shutdown))
}

async fn relay(
  socket: WebSocket,
  mut events: broadcast::Receiver<Notification>,
  shutdown: CancellationToken,
) {
  info!("WebSocket 已连接");
  let (mut sender, mut receiver) = socket.split();

  let mut pending = Some(Notification::message(GREETING));
  loop {
    let notification = match pending.take() {
      Some(notification) => notification,
      None => tokio::select! {
        _ = shutdown.cancelled() => break,
        event = events.recv() => match event {
          Ok(notification) => notification,
          Err(RecvError::Lagged(skipped)) => {
            warn!("WebSocket 客户端过慢，丢弃 {} 条事件", skipped);
            continue;
          }
          Err(RecvError::Closed) => break,
        },
        incoming = receiver.next() => match incoming {
          Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
          Some(Ok(other)) => {
            debug!("忽略客户端消息: {:?}", other);
            continue;
          }
        },
      },
    };

    let text = match serde_json::to_string(&notification) {
      Ok(text) => text,
      Err(e) => {
        warn!("事件序列化失败: {}", e);
        continue;
      }
    };
    if sender.send(Message::Text(text)).await.is_err() {
      break;
    }
  }

  let _ = sender.close().await;
  info!("WebSocket 已断开");
}
