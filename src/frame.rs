// 该文件是 Renliu （人流） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use image::RgbImage;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
}

/// 一帧 RGB 图像（HWC 排列，每通道 8 位）
///
/// 帧由输入源产生，仅被使用一次，不在帧之间共享。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  image: RgbImage,
}

impl Frame {
  pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }

    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::LengthMismatch {
      expected,
      actual: 0,
    })?;
    Ok(Self { image })
  }

  /// 纯色帧，主要用于测试与占位
  pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Result<Self, FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }
    Ok(Self {
      image: RgbImage::from_pixel(width, height, image::Rgb(color)),
    })
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn as_nhwc(&self) -> &[u8] {
    self.image.as_raw()
  }

  pub fn as_rgb_image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_rgb_image(self) -> RgbImage {
    self.image
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_raw_checks_length() {
    let err = Frame::from_raw(4, 2, vec![0u8; 10]).unwrap_err();
    match err {
      FrameError::LengthMismatch { expected, actual } => {
        assert_eq!(expected, 24);
        assert_eq!(actual, 10);
      }
      _ => panic!("Expected LengthMismatch"),
    }
  }

  #[test]
  fn test_from_raw_rejects_empty_shape() {
    assert!(matches!(
      Frame::from_raw(0, 2, vec![]),
      Err(FrameError::InvalidShape { .. })
    ));
  }

  #[test]
  fn test_from_raw_keeps_hwc_layout() {
    let data: Vec<u8> = (0..12).collect();
    let frame = Frame::from_raw(2, 2, data.clone()).unwrap();
    assert_eq!(frame.width(), 2);
    assert_eq!(frame.height(), 2);
    assert_eq!(frame.as_nhwc(), data.as_slice());
    // 第二个像素 (x=1, y=0)
    assert_eq!(frame.as_rgb_image().get_pixel(1, 0).0, [3, 4, 5]);
  }
}
