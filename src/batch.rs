// 该文件是 Renliu （人流） 项目的一部分。
// src/batch.rs - 单次检测客户端
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

//! # 单次检测客户端
//!
//! 状态机 `Idle -> Submitted -> {Completed, Failed}`。每次提交恰好调用一次检测服务，
//! 不设超时、不重试；重新提交即为重试。

use std::path::Path;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
  annotate::Annotator,
  client::{ClientError, DetectOptions, DetectReply, DetectionBackend},
  codec::{self, CodecError, EncodedImage},
  frame::Frame,
  service::DetectionResponse,
};

pub const UNREACHABLE_HINT: &str = "make sure the detection service is running";

/// 待提交的图像
///
/// 原始字节原样发送；若调用方已有解码后的帧，则不再重复解码。
#[derive(Debug, Clone)]
pub struct Upload {
  image: EncodedImage,
  frame: Option<Frame>,
}

impl Upload {
  pub fn from_bytes(bytes: Vec<u8>) -> Self {
    Self {
      image: EncodedImage::from_bytes(bytes),
      frame: None,
    }
  }

  pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
    Ok(Self::from_bytes(std::fs::read(path)?))
  }

  /// 由内存中的帧构造，先编码为 JPEG
  pub fn from_frame(frame: Frame) -> Result<Self, CodecError> {
    let image = codec::encode(&frame)?;
    Ok(Self {
      image,
      frame: Some(frame),
    })
  }

  pub fn len(&self) -> usize {
    self.image.len()
  }

  pub fn is_empty(&self) -> bool {
    self.image.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
  pub annotated: Frame,
  pub person_count: usize,
  pub response: DetectionResponse,
  /// 服务返回的原始 JSON 响应体，含结果结构之外的字段
  pub raw: serde_json::Value,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchFailure {
  #[error("无法连接检测服务 ({hint}): {detail}")]
  ServiceUnreachable { hint: &'static str, detail: String },
  #[error("无效图像: {0}")]
  InvalidImage(String),
  #[error("检测服务返回错误 {status}: {body}")]
  ServiceError { status: u16, body: String },
  #[error("请求失败: {0}")]
  Transport(String),
}

impl From<ClientError> for BatchFailure {
  fn from(err: ClientError) -> Self {
    match err {
      ClientError::Unreachable(detail) => BatchFailure::ServiceUnreachable {
        hint: UNREACHABLE_HINT,
        detail,
      },
      ClientError::InvalidImage(msg) => BatchFailure::InvalidImage(msg),
      ClientError::Status { status, body } => BatchFailure::ServiceError { status, body },
      other @ (ClientError::Timeout | ClientError::Malformed(_) | ClientError::Transport(_)) => {
        BatchFailure::Transport(other.to_string())
      }
    }
  }
}

#[derive(Debug, Clone, Default)]
pub enum BatchState {
  #[default]
  Idle,
  Submitted,
  Completed(BatchOutcome),
  Failed(BatchFailure),
}

impl BatchState {
  pub fn is_idle(&self) -> bool {
    matches!(self, BatchState::Idle)
  }

  pub fn outcome(&self) -> Option<&BatchOutcome> {
    match self {
      BatchState::Completed(outcome) => Some(outcome),
      _ => None,
    }
  }

  pub fn failure(&self) -> Option<&BatchFailure> {
    match self {
      BatchState::Failed(failure) => Some(failure),
      _ => None,
    }
  }
}

pub struct BatchClient<B> {
  backend: B,
  annotator: Annotator,
  confidence: Option<f32>,
  state: BatchState,
}

impl<B: DetectionBackend> BatchClient<B> {
  pub fn new(backend: B, annotator: Annotator) -> Self {
    Self {
      backend,
      annotator,
      confidence: None,
      state: BatchState::Idle,
    }
  }

  /// 指定置信度阈值；未指定时由服务端默认值决定
  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = Some(confidence);
    self
  }

  pub fn state(&self) -> &BatchState {
    &self.state
  }

  pub fn reset(&mut self) {
    self.state = BatchState::Idle;
  }

  /// 提交一张图像并等待结果
  pub async fn submit(&mut self, upload: Upload) -> &BatchState {
    self.state = BatchState::Submitted;
    info!("提交检测请求，图像 {} 字节", upload.len());

    let mut options = DetectOptions::default();
    if let Some(confidence) = self.confidence {
      options = options.with_confidence(confidence);
    }

    let Upload { image, frame } = upload;
    // 本地解码用于绘制结果，发送的字节保持不变
    let local = frame.map(Ok).unwrap_or_else(|| codec::decode(image.as_bytes()));

    self.state = match self.backend.detect_raw(image, options).await {
      Ok(reply) => self.complete(local, reply),
      Err(err) => {
        let failure = BatchFailure::from(err);
        match &failure {
          BatchFailure::ServiceUnreachable { detail, .. } => {
            error!("无法连接检测服务: {}", detail);
            warn!("请确认检测服务已启动 ({})", UNREACHABLE_HINT);
          }
          other => error!("检测失败: {}", other),
        }
        BatchState::Failed(failure)
      }
    };
    &self.state
  }

  fn complete(&self, local: Result<Frame, CodecError>, reply: DetectReply) -> BatchState {
    let frame = match local {
      Ok(frame) => frame,
      Err(e) => {
        error!("本地无法解码图像，无法绘制结果: {}", e);
        return BatchState::Failed(BatchFailure::InvalidImage(e.to_string()));
      }
    };
    let DetectReply { response, raw } = reply;

    info!("检测完成，人数: {}", response.person_count);
    BatchState::Completed(BatchOutcome {
      annotated: self.annotator.render(&frame, &response),
      person_count: response.person_count,
      response,
      raw,
    })
  }
}
