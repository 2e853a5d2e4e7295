// 该文件是 Renliu （人流） 项目的一部分。
// src/annotate.rs - 检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;

use crate::{
  frame::Frame,
  service::{Detection, DetectionResponse},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_HEIGHT: i32 = 20;
const LABEL_GAP: i32 = 2; // 标签与边框之间的间距
const BOX_THICKNESS: u32 = 2;
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色

#[derive(Error, Debug)]
pub enum AnnotateError {
  #[error("无法加载字体: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 标注渲染器
///
/// 纯函数式：不做 I/O，只在边框线与文字笔画处修改像素。
#[derive(Clone)]
pub struct Annotator {
  font: FontArc,
  font_size: f32,
  label_text_height: i32,
  thickness: u32,
  color: Rgb<u8>,
}

impl Annotator {
  /// 使用内置字体创建渲染器
  pub fn new() -> Result<Self, AnnotateError> {
    let font_data = include_bytes!("../assets/DejaVuSans.ttf");
    Self::with_font(FontArc::try_from_slice(font_data)?)
  }

  pub fn with_font(font: FontArc) -> Result<Self, AnnotateError> {
    Ok(Self {
      font,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      thickness: BOX_THICKNESS,
      color: Rgb(BOX_COLOR),
    })
  }

  pub fn color(mut self, color: [u8; 3]) -> Self {
    self.color = Rgb(color);
    self
  }

  pub fn thickness(mut self, thickness: u32) -> Self {
    self.thickness = thickness.max(1);
    self
  }

  pub fn font_size(mut self, font_size: f32) -> Self {
    self.font_size = font_size;
    self.label_text_height = (font_size * 1.25).ceil() as i32;
    self
  }

  /// 在原始帧的副本上绘制全部检测结果；无检测时返回逐像素相同的副本
  pub fn render(&self, frame: &Frame, response: &DetectionResponse) -> Frame {
    if response.is_empty() {
      return frame.clone();
    }

    let mut image = frame.as_rgb_image().clone();
    self.draw_detections_on_image(&mut image, &response.detected_objects);
    Frame::from(image)
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
      self.draw_bbox_with_label(image, detection);
    }
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let bbox = &detection.bbox;

    // 边框来自服务端，仍然裁剪到图像范围内，保证不会越界
    let x_min = (bbox.x1() as i32).clamp(0, w - 1);
    let y_min = (bbox.y1() as i32).clamp(0, h - 1);
    let x_max = (bbox.x2() as i32).clamp(0, w - 1);
    let y_max = (bbox.y2() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 绘制边框（由外向内逐层加粗）
    for t in 0..self.thickness as i32 {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, self.color);
    }

    let label = format!("{}: {:.2}", detection.class_name, detection.confidence);

    // 标签放在边框上方，没有空间时贴着图像顶部
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height - LABEL_GAP).max(0);
    draw_text_mut(
      image,
      self.color,
      label_x,
      label_y,
      PxScale::from(self.font_size),
      &self.font,
      &label,
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::service::BoundingBox;

  const BACKGROUND: [u8; 3] = [10, 20, 30];

  fn response(boxes: &[[u32; 4]]) -> DetectionResponse {
    DetectionResponse::new(
      boxes
        .iter()
        .map(|b| Detection {
          class_name: "person".into(),
          confidence: 0.87,
          bbox: BoundingBox::try_from(*b).unwrap(),
        })
        .collect(),
    )
  }

  #[test]
  fn test_empty_response_is_identity() {
    let annotator = Annotator::new().unwrap();
    let frame = Frame::filled(64, 48, BACKGROUND).unwrap();
    let rendered = annotator.render(&frame, &DetectionResponse::empty());
    assert_eq!(rendered, frame);
  }

  #[test]
  fn test_box_edges_are_drawn() {
    let annotator = Annotator::new().unwrap();
    let frame = Frame::filled(200, 200, BACKGROUND).unwrap();
    let rendered = annotator.render(&frame, &response(&[[50, 80, 150, 180]]));
    let image = rendered.as_rgb_image();

    assert_eq!(image.get_pixel(50, 120).0, BOX_COLOR);
    assert_eq!(image.get_pixel(51, 120).0, BOX_COLOR);
    assert_eq!(image.get_pixel(150, 120).0, BOX_COLOR);
    assert_eq!(image.get_pixel(100, 180).0, BOX_COLOR);
    // 框内与框外远处不变
    assert_eq!(image.get_pixel(100, 130).0, BACKGROUND);
    assert_eq!(image.get_pixel(190, 190).0, BACKGROUND);
    // 原始帧不被修改
    assert_eq!(frame.as_rgb_image().get_pixel(50, 120).0, BACKGROUND);
  }

  #[test]
  fn test_label_is_drawn_above_box() {
    let annotator = Annotator::new().unwrap();
    let frame = Frame::filled(200, 200, BACKGROUND).unwrap();
    let rendered = annotator.render(&frame, &response(&[[50, 80, 150, 180]]));
    let image = rendered.as_rgb_image();

    let changed_above = (50..150)
      .flat_map(|x| (50..80).map(move |y| (x, y)))
      .filter(|&(x, y)| image.get_pixel(x, y).0 != BACKGROUND)
      .count();
    assert!(changed_above > 0, "label glyphs expected above the box");

    // 标签区域左侧不受影响
    let changed_left = (0..45)
      .flat_map(|x| (0..200).map(move |y| (x, y)))
      .filter(|&(x, y)| image.get_pixel(x, y).0 != BACKGROUND)
      .count();
    assert_eq!(changed_left, 0);
  }

  #[test]
  fn test_box_at_top_edge_does_not_panic() {
    let annotator = Annotator::new().unwrap();
    let frame = Frame::filled(32, 32, BACKGROUND).unwrap();
    let rendered = annotator.render(&frame, &response(&[[0, 0, 31, 31]]));
    assert_eq!(rendered.as_rgb_image().get_pixel(0, 31).0, BOX_COLOR);
  }

  #[test]
  fn test_out_of_bounds_box_is_clamped() {
    let annotator = Annotator::new().unwrap();
    let frame = Frame::filled(32, 32, BACKGROUND).unwrap();
    let rendered = annotator.render(&frame, &response(&[[10, 10, 400, 400]]));
    assert_eq!(rendered.width(), 32);
    assert_eq!(rendered.as_rgb_image().get_pixel(31, 20).0, BOX_COLOR);
  }

  #[test]
  fn test_custom_color_and_thickness() {
    let annotator = Annotator::new().unwrap().color([255, 0, 0]).thickness(3);
    let frame = Frame::filled(100, 100, BACKGROUND).unwrap();
    let rendered = annotator.render(&frame, &response(&[[40, 40, 90, 90]]));
    let image = rendered.as_rgb_image();
    assert_eq!(image.get_pixel(42, 60).0, [255, 0, 0]);
    assert_eq!(image.get_pixel(43, 60).0, BACKGROUND);
  }
}
