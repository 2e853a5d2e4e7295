// 该文件是 Renliu （人流） 项目的一部分。
// src/bin/renliu_detect.rs - 单张图像检测
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use renliu::{
  FromUrl,
  annotate::Annotator,
  batch::{BatchClient, Upload},
  client::HttpDetectionClient,
  config::DEFAULT_ENDPOINT,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

/// Renliu 单张图像检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 待检测的图像文件
  #[arg(long, value_name = "FILE")]
  pub input: PathBuf,
  /// 输出，例如 image:///tmp/result.jpg?json 或 folder:///tmp/records?always
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 检测服务地址
  #[arg(long, default_value = DEFAULT_ENDPOINT, value_name = "URL")]
  pub endpoint: Url,
  /// 置信度阈值 (0.0 - 1.0)，缺省时使用服务端默认值
  #[arg(long, value_name = "THRESHOLD")]
  pub confidence: Option<f32>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入文件: {}", args.input.display());
  info!("检测服务: {}", args.endpoint);
  info!("输出路径: {}", args.output);

  let runtime = tokio::runtime::Runtime::new()?;
  let upload = Upload::from_path(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let mut client = BatchClient::new(HttpDetectionClient::new(args.endpoint)?, Annotator::new()?);
  if let Some(confidence) = args.confidence {
    client = client.with_confidence(confidence);
  }

  OneShotTask::new(runtime.handle().clone()).run_task(upload, client, output)?;

  Ok(())
}
