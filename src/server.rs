// 该文件是 Renliu （人流） 项目的一部分。
// src/server.rs - 检测服务 HTTP 接口
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

use std::{future::Future, sync::Arc};

use axum::{
  Json, Router,
  extract::{DefaultBodyLimit, Multipart, Query, State, multipart::MultipartRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::{
  client::UPLOAD_FIELD,
  config::ServiceConfig,
  model::Model,
  service::{DetectionResponse, DetectionService, ServiceError},
};

pub const WELCOME_MESSAGE: &str = "Welcome to the Renliu occupancy counter API!";

/// 错误响应体 `{ "error": <类别>, "message": <描述> }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
  pub error: String,
  pub message: String,
}

impl ErrorBody {
  pub const INVALID_IMAGE: &'static str = "invalid_image";
  pub const MISSING_FILE: &'static str = "missing_file";
  pub const INVALID_THRESHOLD: &'static str = "invalid_threshold";
  pub const INVALID_REQUEST: &'static str = "invalid_request";
  pub const INFERENCE_FAILED: &'static str = "inference_failed";
}

#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  kind: &'static str,
  message: String,
}

impl ApiError {
  fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
    Self {
      status,
      kind,
      message: message.into(),
    }
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  pub fn kind(&self) -> &'static str {
    self.kind
  }
}

impl From<ServiceError> for ApiError {
  fn from(err: ServiceError) -> Self {
    match err {
      ServiceError::InvalidImage(_) => ApiError::new(
        StatusCode::UNPROCESSABLE_ENTITY,
        ErrorBody::INVALID_IMAGE,
        err.to_string(),
      ),
      ServiceError::InvalidThreshold(_) => ApiError::new(
        StatusCode::BAD_REQUEST,
        ErrorBody::INVALID_THRESHOLD,
        err.to_string(),
      ),
      ServiceError::Inference(_) | ServiceError::VocabularyMissing(_) => ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody::INFERENCE_FAILED,
        err.to_string(),
      ),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let body = ErrorBody {
      error: self.kind.to_string(),
      message: self.message,
    };
    (self.status, Json(body)).into_response()
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct DetectQuery {
  pub confidence: Option<String>,
}

impl DetectQuery {
  /// 解析阈值，缺省时使用服务端默认值
  fn threshold(&self, default: f32) -> Result<f32, ApiError> {
    match self.confidence.as_deref() {
      None => Ok(default),
      Some(raw) => raw.trim().parse::<f32>().map_err(|_| {
        ApiError::new(
          StatusCode::BAD_REQUEST,
          ErrorBody::INVALID_THRESHOLD,
          format!("无法解析置信度阈值: '{}'", raw),
        )
      }),
    }
  }
}

struct AppState<M> {
  service: Arc<DetectionService<M>>,
  default_confidence: f32,
}

impl<M> Clone for AppState<M> {
  fn clone(&self) -> Self {
    Self {
      service: self.service.clone(),
      default_confidence: self.default_confidence,
    }
  }
}

/// 构建路由：`GET /`，`POST /detect` 与 `POST /detect/`
pub fn router<M: Model + 'static>(service: Arc<DetectionService<M>>, config: &ServiceConfig) -> Router {
  let state = AppState {
    service,
    default_confidence: config.default_confidence,
  };

  Router::new()
    .route("/", get(welcome))
    .route("/detect", post(detect::<M>))
    .route("/detect/", post(detect::<M>))
    .layer(DefaultBodyLimit::max(config.max_upload_bytes))
    .with_state(state)
}

/// 在给定监听器上运行服务，`shutdown` 完成后优雅退出
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  if let Ok(addr) = listener.local_addr() {
    info!("检测服务监听于 http://{}", addr);
  }
  axum::serve(listener, router)
    .with_graceful_shutdown(shutdown)
    .await
}

async fn welcome() -> Json<serde_json::Value> {
  Json(serde_json::json!({ "message": WELCOME_MESSAGE }))
}

async fn detect<M: Model + 'static>(
  State(state): State<AppState<M>>,
  Query(query): Query<DetectQuery>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, ApiError> {
  let threshold = query.threshold(state.default_confidence)?;

  let mut multipart = multipart.map_err(|e| {
    ApiError::new(
      StatusCode::BAD_REQUEST,
      ErrorBody::MISSING_FILE,
      format!("请求须为 multipart 表单，字段 '{}' 携带图像: {}", UPLOAD_FIELD, e),
    )
  })?;

  let mut upload = None;
  loop {
    let field = match multipart.next_field().await {
      Ok(Some(field)) => field,
      Ok(None) => break,
      Err(e) => {
        return Err(ApiError::new(e.status(), ErrorBody::INVALID_REQUEST, e.body_text()));
      }
    };
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }
    let data = field
      .bytes()
      .await
      .map_err(|e| ApiError::new(e.status(), ErrorBody::INVALID_REQUEST, e.body_text()))?;
    upload = Some(data);
    break;
  }

  let upload = upload.ok_or_else(|| {
    ApiError::new(
      StatusCode::BAD_REQUEST,
      ErrorBody::MISSING_FILE,
      format!("缺少上传字段 '{}'", UPLOAD_FIELD),
    )
  })?;
  debug!("收到检测请求，图像 {} 字节，阈值 {}", upload.len(), threshold);

  let service = state.service.clone();
  let result = tokio::task::spawn_blocking(move || service.detect(&upload, threshold))
    .await
    .map_err(|e| {
      error!("推理任务异常退出: {}", e);
      ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody::INFERENCE_FAILED,
        e.to_string(),
      )
    })?;

  match result {
    Ok(response) => {
      debug!("检测到 {} 个目标", response.person_count);
      Ok(Json(response))
    }
    Err(err) => {
      match &err {
        ServiceError::InvalidImage(e) => warn!("无法解码上传图像: {}", e),
        other => error!("检测失败: {}", other),
      }
      Err(ApiError::from(err))
    }
  }
}
