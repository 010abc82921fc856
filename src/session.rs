// 该文件是 Miaojian （苗鉴） 项目的一部分。
// src/session.rs - 摄像头会话与取消句柄
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

//! 每路摄像头流持有独立的取消令牌，停止请求按会话编号定位。
//! 同一时间只允许一路摄像头流。

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
  #[error("摄像头正在使用中 (会话 {0})")]
  Busy(Uuid),
}

/// 停止请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
  Stopped(Uuid),
  /// 当前没有活动的摄像头流
  Idle,
  /// 指定的会话不存在
  NotFound,
}

struct ActiveSession {
  id: Uuid,
  token: CancellationToken,
}

#[derive(Default)]
struct Slot {
  active: Option<ActiveSession>,
}

/// 摄像头会话登记表
#[derive(Clone, Default)]
pub struct CameraSessions {
  slot: Arc<Mutex<Slot>>,
  shutdown: CancellationToken,
}

impl CameraSessions {
  fn lock(&self) -> MutexGuard<'_, Slot> {
    self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// 登记一路新的摄像头流
  pub fn begin(&self) -> Result<CameraSession, SessionError> {
    let mut slot = self.lock();
    if let Some(active) = &slot.active {
      return Err(SessionError::Busy(active.id));
    }
    let id = Uuid::new_v4();
    let token = self.shutdown.child_token();
    slot.active = Some(ActiveSession {
      id,
      token: token.clone(),
    });
    info!("摄像头会话开始: {}", id);
    Ok(CameraSession {
      id,
      token,
      sessions: self.clone(),
    })
  }

  /// 取消指定会话；未指定时取消当前唯一的会话
  pub fn stop(&self, id: Option<Uuid>) -> StopOutcome {
    let slot = self.lock();
    match (&slot.active, id) {
      (None, None) => StopOutcome::Idle,
      (None, Some(_)) => StopOutcome::NotFound,
      (Some(active), Some(id)) if active.id != id => StopOutcome::NotFound,
      (Some(active), _) => {
        info!("收到停止请求，取消摄像头会话: {}", active.id);
        active.token.cancel();
        StopOutcome::Stopped(active.id)
      }
    }
  }

  pub fn active(&self) -> Option<Uuid> {
    self.lock().active.as_ref().map(|a| a.id)
  }

  /// 服务关闭时取消所有会话
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  /// 服务级取消令牌，非摄像头流也从这里派生
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  fn release(&self, id: Uuid) {
    let mut slot = self.lock();
    if slot.active.as_ref().map(|a| a.id) == Some(id) {
      slot.active = None;
      info!("摄像头会话结束: {}", id);
    }
  }
}

/// 一路摄像头流的句柄，析构时归还登记位
pub struct CameraSession {
  id: Uuid,
  token: CancellationToken,
  sessions: CameraSessions,
}

impl CameraSession {
  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }
}

impl Drop for CameraSession {
  fn drop(&mut self) {
    self.sessions.release(self.id);
  }
}
