// 该文件是 Renliu （人流） 项目的一部分。
// src/config.rs - 服务与客户端配置
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

use std::{
  net::{Ipv4Addr, SocketAddr},
  time::Duration,
};

use thiserror::Error;
use url::Url;

use crate::service::{DEFAULT_CONFIDENCE, DEFAULT_TARGET_CLASS};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/detect/";
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("置信度阈值必须在 [0, 1] 区间内: {0}")]
  InvalidConfidence(f32),
  #[error("目标类别不能为空")]
  EmptyTargetClass,
  #[error("上传大小上限不能为 0")]
  ZeroUploadLimit,
  #[error("流式超时不能为 0")]
  ZeroTimeout,
  #[error("检测服务地址必须为 http(s): {0}")]
  InvalidEndpoint(String),
}

fn check_confidence(confidence: f32) -> Result<(), ConfigError> {
  if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
    Ok(())
  } else {
    Err(ConfigError::InvalidConfidence(confidence))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
  pub bind: SocketAddr,
  pub target_class: String,
  pub default_confidence: f32,
  pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
      target_class: DEFAULT_TARGET_CLASS.to_string(),
      default_confidence: DEFAULT_CONFIDENCE,
      max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
    }
  }
}

impl ServiceConfig {
  pub fn validate(self) -> Result<Self, ConfigError> {
    if self.target_class.trim().is_empty() {
      return Err(ConfigError::EmptyTargetClass);
    }
    check_confidence(self.default_confidence)?;
    if self.max_upload_bytes == 0 {
      return Err(ConfigError::ZeroUploadLimit);
    }
    Ok(self)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
  pub endpoint: Url,
  pub confidence: f32,
  pub stream_timeout: Duration,
}

impl ClientConfig {
  /// 以默认阈值与流式超时创建
  pub fn new(endpoint: Url) -> Self {
    Self {
      endpoint,
      confidence: DEFAULT_CONFIDENCE,
      stream_timeout: DEFAULT_STREAM_TIMEOUT,
    }
  }

  pub fn validate(self) -> Result<Self, ConfigError> {
    match self.endpoint.scheme() {
      "http" | "https" => {}
      _ => return Err(ConfigError::InvalidEndpoint(self.endpoint.to_string())),
    }
    check_confidence(self.confidence)?;
    if self.stream_timeout.is_zero() {
      return Err(ConfigError::ZeroTimeout);
    }
    Ok(self)
  }
}
