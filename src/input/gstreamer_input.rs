// 该文件是 Renliu （人流） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频输入
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

//! # GStreamer 视频输入
//!
//! 支持的 URL：
//!
//! - `gst://camera/dev/video0?width=640&height=480&fps=15&rotate=90`：V4L2 摄像头
//! - `gst://file/path/to/video.mp4?width=640&height=480`：视频文件
//! - `gst://test?width=640&height=480&fps=15`：测试图案
//!
//! appsink 只保留最新的两帧并丢弃过期帧，消费方处理不及时不会让视频源等待。
//!
//! 需要系统安装 GStreamer 开发库（`libgstreamer1.0-dev`、`libgstreamer-plugins-base1.0-dev`）。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("不支持的视频源: {0}")]
  UnknownSource(String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望至少 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态切换错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

enum PipelineItem {
  FileSource(String),
  CameraSource {
    device: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  TestSource {
    width: u32,
    height: u32,
    fps: u32,
  },
  Scale {
    width: u32,
    height: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location=\"{}\" ! decodebin", path),
      PipelineItem::CameraSource {
        device,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          device, io_mode, format, width, height, fps
        )
      }
      PipelineItem::TestSource { width, height, fps } => format!(
        "videotestsrc is-live=true ! video/x-raw,width={},height={},framerate={}/1",
        width, height, fps
      ),
      PipelineItem::Scale { width, height } => format!(
        "videoscale ! video/x-raw,width={},height={}",
        width, height
      ),
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

fn query_u32(query: &HashMap<String, String>, key: &str) -> Option<u32> {
  query.get(key).and_then(|v| v.parse::<u32>().ok())
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<PipelineItem>,
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl GStreamerInputPipelineBuilder {
  const DEFAULT_WIDTH: u32 = 640;
  const DEFAULT_HEIGHT: u32 = 480;
  const DEFAULT_FPS: u32 = 15;

  fn camera(device: &str, query: &HashMap<String, String>) -> Vec<PipelineItem> {
    vec![PipelineItem::CameraSource {
      device: device.to_string(),
      io_mode: query_u32(query, "io-mode"),
      format: query
        .get("format")
        .cloned()
        .unwrap_or_else(|| String::from("YUY2")),
      width: query_u32(query, "width").unwrap_or(Self::DEFAULT_WIDTH),
      height: query_u32(query, "height").unwrap_or(Self::DEFAULT_HEIGHT),
      fps: query_u32(query, "fps").unwrap_or(Self::DEFAULT_FPS),
    }]
  }

  fn file(path: &str, query: &HashMap<String, String>) -> Vec<PipelineItem> {
    let mut items = vec![PipelineItem::FileSource(path.to_string())];
    if let (Some(width), Some(height)) = (query_u32(query, "width"), query_u32(query, "height")) {
      items.push(PipelineItem::Scale { width, height });
    }
    items
  }

  fn test(query: &HashMap<String, String>) -> Vec<PipelineItem> {
    vec![PipelineItem::TestSource {
      width: query_u32(query, "width").unwrap_or(Self::DEFAULT_WIDTH),
      height: query_u32(query, "height").unwrap_or(Self::DEFAULT_HEIGHT),
      fps: query_u32(query, "fps").unwrap_or(Self::DEFAULT_FPS),
    }]
  }

  fn video_flip(rotate: Option<&str>) -> Option<PipelineItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(PipelineItem::VideoFlip { method })
  }

  /// 管道描述（不含 appsink）
  pub fn description(&self) -> String {
    self
      .items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = format!(
      "{} ! appsink max-buffers=2 drop=true sync=false name=sink",
      self.description()
    );
    info!("GStreamer 管道: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkNotFound)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput { pipeline, appsink })
  }
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let mut items = match url.host_str() {
      Some("camera") => Self::camera(url.path(), &query),
      Some("file") => Self::file(url.path(), &query),
      Some("test") => Self::test(&query),
      other => {
        return Err(GStreamerInputError::UnknownSource(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    if let Some(flip) = Self::video_flip(query.get("rotate").map(String::as_str)) {
      items.push(flip);
    }
    items.push(PipelineItem::TargetFormat);

    Ok(GStreamerInputPipelineBuilder { items })
  }
}

/// GStreamer 视频输入，逐帧迭代输出 RGB 帧
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止 GStreamer 管道: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn into_frames(self) -> GStreamerFrames {
    GStreamerFrames { inner: self }
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        // 流结束时同样返回错误
        info!("视频流结束: {}", e);
        e
      })
      .ok()
  }
}

pub struct GStreamerFrames {
  inner: GStreamerInput,
}

impl Iterator for GStreamerFrames {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let sample = self.inner.pull_sample()?;
      match convert_sample(&sample) {
        Ok(frame) => return Some(frame),
        // 单帧转换失败时跳过该帧，继续拉取
        Err(e) => error!("无法转换视频帧: {}", e),
      }
    }
  }
}

fn convert_sample(sample: &gst::Sample) -> Result<Frame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("sample 中没有 buffer".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("sample 中没有 caps".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  // 行跨度可能带有对齐填充
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射 buffer: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * (height.saturating_sub(1)) + width * 3;
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(width * height * 3);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for row in 0..height {
        pixels.extend_from_slice(&data[row * stride..row * stride + width * 3]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for row in 0..height {
        for bgr in data[row * stride..row * stride + width * 3].chunks_exact(3) {
          pixels.extend_from_slice(&[bgr[2], bgr[1], bgr[0]]);
        }
      }
    }
    other => return Err(GStreamerInputError::UnsupportedFormat(other)),
  }

  Frame::from_raw(width as u32, height as u32, pixels)
    .map_err(|e| GStreamerInputError::PipelineError(e.to_string()))
}
