// 该文件是 Renliu （人流） 项目的一部分。
// src/bin/renliu_server.rs - 检测服务
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

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use url::Url;

use renliu::{
  FromUrl,
  config::{DEFAULT_MAX_UPLOAD_BYTES, ServiceConfig},
  model::YoloModelBuilder,
  server,
  service::DetectionService,
};

/// Renliu 检测服务参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型，例如 onnx:///models/yolov8n.onnx?labels=/models/coco.txt
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 监听地址
  #[arg(long, default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub bind: SocketAddr,
  /// 目标类别
  #[arg(long, default_value = "person", value_name = "CLASS")]
  pub target_class: String,
  /// 默认置信度阈值 (0.0 - 1.0)，请求可通过 `confidence` 参数覆盖
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 上传大小上限（字节）
  #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES, value_name = "BYTES")]
  pub max_upload_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = ServiceConfig {
    bind: args.bind,
    target_class: args.target_class,
    default_confidence: args.confidence,
    max_upload_bytes: args.max_upload_bytes,
  }
  .validate()?;

  info!("模型: {}", args.model);
  let model = YoloModelBuilder::from_url(&args.model)?.build()?;
  let service = Arc::new(DetectionService::new(model, &config.target_class)?);
  info!(
    "检测服务就绪，目标类别 '{}'，默认阈值 {}",
    service.target_class(),
    config.default_confidence
  );

  let app = server::router(service, &config);
  let listener = TcpListener::bind(config.bind).await?;
  server::serve(listener, app, async {
    let _ = tokio::signal::ctrl_c().await;
    info!("收到中断信号，准备退出...");
  })
  .await?;

  Ok(())
}
