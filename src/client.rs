// 该文件是 Renliu （人流） 项目的一部分。
// src/client.rs - 检测服务客户端
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

use std::{error::Error as _, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
  StatusCode,
  multipart::{Form, Part},
};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  codec::EncodedImage,
  model::Model,
  server::ErrorBody,
  service::{DetectionResponse, DetectionService, ServiceError},
};

pub const UPLOAD_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum ClientError {
  #[error("无法连接检测服务: {0}")]
  Unreachable(String),
  #[error("检测服务超时")]
  Timeout,
  #[error("检测服务拒绝图像: {0}")]
  InvalidImage(String),
  #[error("检测服务返回错误状态 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("无法解析检测结果: {0}")]
  Malformed(String),
  #[error("请求错误: {0}")]
  Transport(String),
}

impl From<reqwest::Error> for ClientError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      ClientError::Timeout
    } else if is_network_failure(&err) {
      ClientError::Unreachable(err.to_string())
    } else if err.is_decode() {
      ClientError::Malformed(err.to_string())
    } else {
      ClientError::Transport(err.to_string())
    }
  }
}

/// 连接被拒绝、重置、中断，或请求发送途中失败
fn is_network_failure(err: &reqwest::Error) -> bool {
  if err.is_connect() || err.is_request() {
    return true;
  }
  let mut source = err.source();
  while let Some(cause) = source {
    if let Some(io_err) = cause.downcast_ref::<io::Error>()
      && matches!(
        io_err.kind(),
        io::ErrorKind::ConnectionRefused
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::BrokenPipe
          | io::ErrorKind::UnexpectedEof
      )
    {
      return true;
    }
    source = cause.source();
  }
  false
}

/// 检测结果，以及服务返回的原始 JSON 响应体
#[derive(Debug, Clone)]
pub struct DetectReply {
  pub response: DetectionResponse,
  pub raw: serde_json::Value,
}

/// 单次检测请求参数
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetectOptions {
  /// 置信度阈值，`None` 时由服务端决定
  pub confidence: Option<f32>,
  /// 请求超时，`None` 表示不设上限
  pub timeout: Option<Duration>,
}

impl DetectOptions {
  pub fn with_confidence(mut self, confidence: f32) -> Self {
    self.confidence = Some(confidence);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// 检测后端：批处理与流式客户端共用的调用边界
#[async_trait]
pub trait DetectionBackend: Send + Sync {
  async fn detect(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectionResponse, ClientError>;

  /// 同 `detect`，并附带原始响应体；进程内后端直接序列化结果
  async fn detect_raw(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectReply, ClientError> {
    let response = self.detect(image, options).await?;
    let raw =
      serde_json::to_value(&response).map_err(|e| ClientError::Malformed(e.to_string()))?;
    Ok(DetectReply { response, raw })
  }
}

#[async_trait]
impl<B: DetectionBackend + ?Sized> DetectionBackend for Arc<B> {
  async fn detect(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectionResponse, ClientError> {
    (**self).detect(image, options).await
  }

  async fn detect_raw(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectReply, ClientError> {
    (**self).detect_raw(image, options).await
  }
}

/// 通过 HTTP 调用检测服务
#[derive(Debug, Clone)]
pub struct HttpDetectionClient {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpDetectionClient {
  pub fn new(endpoint: Url) -> Result<Self, ClientError> {
    let client = reqwest::Client::builder().build()?;
    Ok(Self { client, endpoint })
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }
}

#[async_trait]
impl DetectionBackend for HttpDetectionClient {
  async fn detect(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectionResponse, ClientError> {
    self
      .detect_raw(image, options)
      .await
      .map(|reply| reply.response)
  }

  async fn detect_raw(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectReply, ClientError> {
    let file_name = image.file_name();
    let mime = image.mime();
    let part = Part::bytes(image.into_bytes())
      .file_name(file_name)
      .mime_str(mime)?;
    let form = Form::new().part(UPLOAD_FIELD, part);

    let mut request = self.client.post(self.endpoint.clone()).multipart(form);
    if let Some(confidence) = options.confidence {
      request = request.query(&[("confidence", confidence)]);
    }
    if let Some(timeout) = options.timeout {
      request = request.timeout(timeout);
    }

    let response = request.send().await?;
    let status = response.status();
    debug!("检测服务响应状态: {}", status);

    if status == StatusCode::OK {
      let raw = response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| match ClientError::from(e) {
          ClientError::Transport(msg) => ClientError::Malformed(msg),
          other => other,
        })?;
      let response = serde_json::from_value::<DetectionResponse>(raw.clone())
        .map_err(|e| ClientError::Malformed(e.to_string()))?;
      return Ok(DetectReply { response, raw });
    }

    let body = match response.text().await {
      Ok(body) => body,
      Err(e) => {
        debug!("无法读取错误响应体: {}", e);
        String::new()
      }
    };
    match serde_json::from_str::<ErrorBody>(&body) {
      Ok(error) if error.error == ErrorBody::INVALID_IMAGE => {
        Err(ClientError::InvalidImage(error.message))
      }
      _ => Err(ClientError::Status {
        status: status.as_u16(),
        body,
      }),
    }
  }
}

/// 进程内调用检测服务（不经网络）
///
/// 推理在阻塞线程池中执行，不占用异步工作线程。
pub struct LocalDetectionBackend<M> {
  service: Arc<DetectionService<M>>,
  default_confidence: f32,
}

impl<M> LocalDetectionBackend<M> {
  pub fn new(service: Arc<DetectionService<M>>, default_confidence: f32) -> Self {
    Self {
      service,
      default_confidence,
    }
  }
}

#[async_trait]
impl<M: Model + 'static> DetectionBackend for LocalDetectionBackend<M> {
  async fn detect(
    &self,
    image: EncodedImage,
    options: DetectOptions,
  ) -> Result<DetectionResponse, ClientError> {
    let service = self.service.clone();
    let confidence = options.confidence.unwrap_or(self.default_confidence);
    let task = tokio::task::spawn_blocking(move || service.detect(image.as_bytes(), confidence));

    let joined = match options.timeout {
      Some(timeout) => tokio::time::timeout(timeout, task)
        .await
        .map_err(|_| ClientError::Timeout)?,
      None => task.await,
    };

    match joined.map_err(|e| ClientError::Transport(e.to_string()))? {
      Ok(response) => Ok(response),
      Err(ServiceError::InvalidImage(e)) => Err(ClientError::InvalidImage(e.to_string())),
      Err(e) => Err(ClientError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        body: e.to_string(),
      }),
    }
  }
}
