// 该文件是 Renliu （人流） 项目的一部分。
// src/codec.rs - 帧编解码
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

//! # 帧编解码
//!
//! 在可传输的编码图像字节与内存中的 [`Frame`] 之间转换。批处理与流式两条路径共用，
//! 无内部状态，可并发调用。

use std::io::Cursor;

use image::{ExtendedColorType, ImageFormat, ImageReader, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::debug;

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("图像解码失败: {0}")]
  Decode(String),
  #[error("图像编码失败: {0}")]
  Encode(#[from] image::ImageError),
}

/// 编码后的图像（单帧压缩格式）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
  bytes: Vec<u8>,
  mime: &'static str,
}

impl EncodedImage {
  /// 包装外部给定的编码字节，MIME 类型根据内容猜测
  pub fn from_bytes(bytes: Vec<u8>) -> Self {
    let mime = image::guess_format(&bytes)
      .map(|format| format.to_mime_type())
      .unwrap_or("application/octet-stream");
    Self { bytes, mime }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.bytes
  }

  pub fn mime(&self) -> &'static str {
    self.mime
  }

  pub fn file_name(&self) -> &'static str {
    match self.mime {
      "image/jpeg" => "frame.jpg",
      "image/png" => "frame.png",
      _ => "frame.bin",
    }
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

/// JPEG 编码器
#[derive(Debug, Clone, Copy)]
pub struct JpegCodec {
  quality: u8,
}

impl Default for JpegCodec {
  fn default() -> Self {
    Self {
      quality: DEFAULT_JPEG_QUALITY,
    }
  }
}

impl JpegCodec {
  pub fn with_quality(mut self, quality: u8) -> Self {
    self.quality = quality.clamp(1, 100);
    self
  }

  pub fn encode(&self, frame: &Frame) -> Result<EncodedImage, CodecError> {
    let mut bytes = Vec::with_capacity(frame.as_nhwc().len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, self.quality);
    encoder.encode(
      frame.as_nhwc(),
      frame.width(),
      frame.height(),
      ExtendedColorType::Rgb8,
    )?;
    debug!(
      "编码帧 {}x{} -> {} 字节",
      frame.width(),
      frame.height(),
      bytes.len()
    );

    Ok(EncodedImage {
      bytes,
      mime: ImageFormat::Jpeg.to_mime_type(),
    })
  }
}

/// 以默认质量编码为 JPEG
pub fn encode(frame: &Frame) -> Result<EncodedImage, CodecError> {
  JpegCodec::default().encode(frame)
}

/// 解码任意受支持格式的图像为 RGB 帧
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
  if bytes.is_empty() {
    return Err(CodecError::Decode("空图像数据".to_string()));
  }

  let image = ImageReader::new(Cursor::new(bytes))
    .with_guessed_format()
    .map_err(|e| CodecError::Decode(e.to_string()))?
    .decode()
    .map_err(|e| CodecError::Decode(e.to_string()))?
    .to_rgb8();

  if image.width() == 0 || image.height() == 0 {
    return Err(CodecError::Decode("图像尺寸为零".to_string()));
  }

  Ok(Frame::from(image))
}
