// 该文件是 Renliu （人流） 项目的一部分。
// src/stream.rs - 流式检测客户端
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

//! # 流式检测客户端
//!
//! 每输入一帧必然输出一帧：在截止时间内拿到检测结果则在原始帧上绘制，
//! 否则（编码失败、超时、连接失败、错误状态）原样输出。
//!
//! 请求在独立任务中执行；超过截止时间后调用方不再等待，任务自行结束，结果被丢弃。

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, Instant},
};

use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{
  annotate::Annotator,
  client::{DetectOptions, DetectionBackend},
  codec::JpegCodec,
  config::ClientConfig,
  frame::Frame,
  service::DetectionResponse,
};

#[derive(Debug, Default)]
struct StreamStats {
  seen: AtomicU64,
  annotated: AtomicU64,
  passed_through: AtomicU64,
}

/// 会话计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
  pub seen: u64,
  pub annotated: u64,
  pub passed_through: u64,
}

pub struct StreamingClient<B> {
  backend: Arc<B>,
  annotator: Annotator,
  codec: JpegCodec,
  deadline: Duration,
  confidence: f32,
  stats: StreamStats,
}

impl<B: DetectionBackend + 'static> StreamingClient<B> {
  pub fn new(backend: Arc<B>, annotator: Annotator, deadline: Duration, confidence: f32) -> Self {
    Self {
      backend,
      annotator,
      codec: JpegCodec::default(),
      deadline,
      confidence,
      stats: StreamStats::default(),
    }
  }

  pub fn from_config(backend: Arc<B>, annotator: Annotator, config: &ClientConfig) -> Self {
    Self::new(backend, annotator, config.stream_timeout, config.confidence)
  }

  pub fn deadline(&self) -> Duration {
    self.deadline
  }

  /// 处理一帧，总是返回一帧
  pub async fn process(&self, frame: Frame) -> Frame {
    self.process_with_response(frame).await.0
  }

  /// 同 [`process`](Self::process)，并附带按时到达的检测结果
  pub async fn process_with_response(&self, frame: Frame) -> (Frame, Option<DetectionResponse>) {
    let index = self.stats.seen.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    match self.request(index, &frame).await {
      Some(response) => {
        self.stats.annotated.fetch_add(1, Ordering::Relaxed);
        let annotated = self.annotator.render(&frame, &response);
        debug!(
          "第 {} 帧已标注，{} 人，耗时 {:.2?}",
          index,
          response.person_count,
          started.elapsed()
        );
        (annotated, Some(response))
      }
      None => {
        self.stats.passed_through.fetch_add(1, Ordering::Relaxed);
        (frame, None)
      }
    }
  }

  /// 供运行时之外的同步回调使用
  pub fn process_blocking(&self, handle: &Handle, frame: Frame) -> Frame {
    handle.block_on(self.process(frame))
  }

  pub fn stats(&self) -> StreamSnapshot {
    StreamSnapshot {
      seen: self.stats.seen.load(Ordering::Relaxed),
      annotated: self.stats.annotated.load(Ordering::Relaxed),
      passed_through: self.stats.passed_through.load(Ordering::Relaxed),
    }
  }

  pub fn log_summary(&self) {
    let stats = self.stats();
    info!(
      "流式会话结束: 共 {} 帧，已标注 {} 帧，原样输出 {} 帧",
      stats.seen, stats.annotated, stats.passed_through
    );
  }

  async fn request(&self, index: u64, frame: &Frame) -> Option<DetectionResponse> {
    let image = match self.codec.encode(frame) {
      Ok(image) => image,
      Err(e) => {
        debug!("第 {} 帧编码失败，原样输出: {}", index, e);
        return None;
      }
    };

    let backend = self.backend.clone();
    let options = DetectOptions::default()
      .with_confidence(self.confidence)
      .with_timeout(self.deadline);
    let request = tokio::spawn(async move { backend.detect(image, options).await });

    // 超时后丢弃句柄，任务在后台结束
    match tokio::time::timeout(self.deadline, request).await {
      Err(_) => {
        debug!("第 {} 帧检测超时，原样输出", index);
        None
      }
      Ok(Err(e)) => {
        debug!("第 {} 帧检测任务异常: {}", index, e);
        None
      }
      Ok(Ok(Err(e))) => {
        debug!("第 {} 帧检测失败，原样输出: {}", index, e);
        None
      }
      Ok(Ok(Ok(response))) => Some(response),
    }
  }
}
