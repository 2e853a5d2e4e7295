// 该文件是 Renliu （人流） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::time::{Duration, Instant};

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame, url_file_path};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("无效参数 {key}={value}")]
  InvalidParameter { key: String, value: String },
}

/// 图像文件输入
///
/// `image:///path/to/a.jpg?repeat=N&fps=F`：读取一张图像，重复输出 `N` 次
/// （`repeat=0` 表示无限重复），指定 `fps` 时按该帧率节流，用于模拟视频源。
#[derive(Debug)]
pub struct ImageFileInput {
  frame: Frame,
  repeat: Option<u64>,
  interval: Option<Duration>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ImageFileInputError> {
  value
    .parse::<T>()
    .map_err(|_| ImageFileInputError::InvalidParameter {
      key: key.to_string(),
      value: value.to_string(),
    })
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let mut repeat = Some(1);
    let mut interval = None;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "repeat" => {
          let n: u64 = parse_param(&key, &value)?;
          repeat = if n == 0 { None } else { Some(n) };
        }
        "fps" => {
          let fps: f64 = parse_param(&key, &value)?;
          if !(fps.is_finite() && fps > 0.0) {
            return Err(ImageFileInputError::InvalidParameter {
              key: key.to_string(),
              value: value.to_string(),
            });
          }
          interval = Some(Duration::from_secs_f64(1.0 / fps));
        }
        _ => {}
      }
    }

    let path = url_file_path(url);
    let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;
    info!("读取图像文件: {} ({}x{})", path, image.width(), image.height());

    Ok(ImageFileInput {
      frame: Frame::from(image.to_rgb8()),
      repeat,
      interval,
    })
  }
}

impl ImageFileInput {
  pub fn from_frame(frame: Frame) -> Self {
    Self {
      frame,
      repeat: Some(1),
      interval: None,
    }
  }

  pub fn frame(&self) -> &Frame {
    &self.frame
  }

  pub fn into_frames(self) -> ImageFileFrames {
    ImageFileFrames {
      inner: self,
      emitted: 0,
      last: None,
    }
  }
}

pub struct ImageFileFrames {
  inner: ImageFileInput,
  emitted: u64,
  last: Option<Instant>,
}

impl Iterator for ImageFileFrames {
  type Item = Frame;

  fn next(&mut self) -> Option<Self::Item> {
    if self.inner.repeat.is_some_and(|n| self.emitted >= n) {
      return None;
    }

    if let (Some(interval), Some(last)) = (self.inner.interval, self.last) {
      let elapsed = last.elapsed();
      if elapsed < interval {
        std::thread::sleep(interval - elapsed);
      }
    }
    self.last = Some(Instant::now());
    self.emitted += 1;
    Some(self.inner.frame.clone())
  }
}
