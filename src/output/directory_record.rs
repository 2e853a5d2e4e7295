// 该文件是 Renliu （人流） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::{
  path::PathBuf,
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme, frame::Frame, output::Render, service::DetectionResponse,
  url_file_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 按日期分目录保存帧：`<dir>/YYYY/MM/DD/HH-MM-SS-XXXX.png`
///
/// 默认只保存带检测结果的帧；`?always` 保存所有帧；`?record` 额外写入同名 `.json`。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: AtomicU16,
  always: bool,
  record: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_file_path(uri)),
      frame_counter: AtomicU16::new(0),
      always: uri.query_pairs().any(|(k, _)| k == "always"),
      record: uri.query_pairs().any(|(k, _)| k == "record"),
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self, now: DateTime<Utc>) -> Result<PathBuf, DirectoryRecordOutputError> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(
    &self,
    frame: &Frame,
    response: Option<&DetectionResponse>,
  ) -> Result<(), Self::Error> {
    let detected = response.is_some_and(|r| !r.is_empty());
    if !self.always && !detected {
      return Ok(());
    }

    let path = self.frame_path(Utc::now())?;
    frame.as_rgb_image().save(&path)?;
    debug!("记录帧: {}", path.display());

    if self.record
      && let Some(response) = response
    {
      std::fs::write(path.with_extension("json"), serde_json::to_vec(response)?)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::service::{BoundingBox, Detection};

  fn count_files(dir: &std::path::Path, ext: &str) -> usize {
    let mut count = 0;
    for entry in std::fs::read_dir(dir).unwrap() {
      let path = entry.unwrap().path();
      if path.is_dir() {
        count += count_files(&path, ext);
      } else if path.extension().is_some_and(|e| e == ext) {
        count += 1;
      }
    }
    count
  }

  fn response_with_person() -> DetectionResponse {
    DetectionResponse::new(vec![Detection {
      class_name: "person".into(),
      confidence: 0.9,
      bbox: BoundingBox::new(0, 0, 2, 2).unwrap(),
    }])
  }

  #[test]
  fn test_skips_frames_without_detections() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}?record", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let frame = Frame::filled(4, 4, [0, 0, 0]).unwrap();

    output.render_result(&frame, None).unwrap();
    output
      .render_result(&frame, Some(&DetectionResponse::empty()))
      .unwrap();
    assert_eq!(count_files(dir.path(), "png"), 0);

    output
      .render_result(&frame, Some(&response_with_person()))
      .unwrap();
    assert_eq!(count_files(dir.path(), "png"), 1);
    assert_eq!(count_files(dir.path(), "json"), 1);
  }

  #[test]
  fn test_always_saves_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}?always", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let frame = Frame::filled(4, 4, [0, 0, 0]).unwrap();

    for _ in 0..3 {
      output.render_result(&frame, None).unwrap();
    }
    assert_eq!(count_files(dir.path(), "png"), 3);
    assert_eq!(count_files(dir.path(), "json"), 0);
  }
}
