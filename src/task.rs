// 该文件是 Renliu （人流） 项目的一部分。
// src/task.rs - 任务驱动：输入 -> 检测客户端 -> 输出
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

use std::{thread, time::Duration};

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
  batch::{BatchClient, BatchState, Upload},
  client::DetectionBackend,
  frame::Frame,
  output::Render,
  stream::StreamingClient,
};

pub trait Task<I, C, O>: Sized {
  type Error;
  fn run_task(self, input: I, client: C, output: O) -> Result<(), Self::Error>;
}

/// 单次任务：提交一张图像，保存标注结果
pub struct OneShotTask {
  runtime: Handle,
}

impl OneShotTask {
  pub fn new(runtime: Handle) -> Self {
    Self { runtime }
  }
}

impl<B, O, RE> Task<Upload, BatchClient<B>, O> for OneShotTask
where
  B: DetectionBackend,
  O: Render<Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: Upload, mut client: BatchClient<B>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let now = std::time::Instant::now();
    let state = self.runtime.block_on(client.submit(input));
    info!("请求完成，耗时: {:.2?}", now.elapsed());

    match state {
      BatchState::Completed(outcome) => {
        info!("检测到人数: {}", outcome.person_count);
        debug!("原始响应: {}", outcome.raw);
        output.render_result(&outcome.annotated, Some(&outcome.response))?;
        Ok(())
      }
      BatchState::Failed(failure) => Err(anyhow::Error::new(failure.clone())),
      BatchState::Idle | BatchState::Submitted => Err(anyhow::anyhow!("请求未完成")),
    }
  }
}

/// 连续任务：逐帧经过流式客户端后送往输出
#[derive(Debug)]
pub struct ContinuousTask {
  runtime: Handle,
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn new(runtime: Handle) -> Self {
    Self {
      runtime,
      frame_number: None,
    }
  }

  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<I, B, O, RE> Task<I, StreamingClient<B>, O> for ContinuousTask
where
  I: Iterator<Item = Frame>,
  B: DetectionBackend + 'static,
  O: Render<Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, client: StreamingClient<B>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let (tx, rx) = std::sync::mpsc::channel();

    let handler = ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    if let Err(e) = handler {
      warn!("无法注册 Ctrl-C 处理函数: {}", e);
    }

    let mut frame_index = 0usize;
    for frame in input {
      frame_index = frame_index.wrapping_add(1);
      let now = std::time::Instant::now();
      let (frame, response) = self.runtime.block_on(client.process_with_response(frame));
      let elapsed_a = now.elapsed();
      output.render_result(&frame, response.as_ref())?;
      debug!(
        "第 {} 帧处理完成，耗时: {:.2?} / {:.2?}",
        frame_index,
        elapsed_a,
        now.elapsed()
      );
      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    client.log_summary();
    info!("任务完成，退出");
    Ok(())
  }
}
