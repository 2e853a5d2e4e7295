// 该文件是 Renliu （人流） 项目的一部分。
// src/bin/renliu_stream.rs - 视频流检测
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

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use renliu::{
  FromUrl,
  annotate::Annotator,
  client::HttpDetectionClient,
  config::{ClientConfig, DEFAULT_ENDPOINT},
  input::InputWrapper,
  output::OutputWrapper,
  stream::StreamingClient,
  task::{ContinuousTask, Task},
};

/// Renliu 视频流检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，例如 gst://camera/dev/video0 或 image:///tmp/a.jpg?repeat=0&fps=5
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 folder:///tmp/records
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 检测服务地址
  #[arg(long, default_value = DEFAULT_ENDPOINT, value_name = "URL")]
  pub endpoint: Url,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 每帧检测超时（毫秒），超时后原样输出该帧
  #[arg(long, default_value = "1000", value_name = "MS")]
  pub timeout_ms: u64,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("检测服务: {}", args.endpoint);
  info!("输出路径: {}", args.output);

  let config = ClientConfig {
    endpoint: args.endpoint,
    confidence: args.confidence,
    stream_timeout: Duration::from_millis(args.timeout_ms),
  }
  .validate()?;

  let runtime = tokio::runtime::Runtime::new()?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let backend = Arc::new(HttpDetectionClient::new(config.endpoint.clone())?);
  let client = StreamingClient::from_config(backend, Annotator::new()?, &config);

  ContinuousTask::new(runtime.handle().clone())
    .with_frame_number(args.frame_number)
    .run_task(input.into_frames(), client, output)?;

  Ok(())
}
