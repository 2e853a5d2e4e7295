// 该文件是 Renliu （人流） 项目的一部分。
// src/service.rs - 检测服务
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

//! # 检测服务
//!
//! 包装一个预训练检测模型：输入一张编码图像，输出仅包含目标类别、且置信度高于阈值的
//! 检测结果，以及计数与时间戳。
//!
//! 目标类别在构造时解析为模型类别编号，词表中不存在时构造失败。每次调用相互独立，
//! 模型在进程生命周期内只读共享。

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  codec::{self, CodecError},
  model::{DetectItem, Model},
};

pub const DEFAULT_TARGET_CLASS: &str = "person";
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error("模型词表中不存在目标类别 '{0}'")]
  VocabularyMissing(String),
  #[error("无效图像: {0}")]
  InvalidImage(#[from] CodecError),
  #[error("置信度阈值必须在 [0, 1] 区间内: {0}")]
  InvalidThreshold(f32),
  #[error("推理失败: {0}")]
  Inference(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("边界框无效: [{0}, {1}, {2}, {3}]")]
pub struct InvalidBoundingBox(pub u32, pub u32, pub u32, pub u32);

/// 像素坐标边界框 `[x1, y1, x2, y2]`，保证 `x1 < x2`、`y1 < y2`
///
/// 线上格式为四个整数组成的数组。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[u32; 4]", into = "[u32; 4]")]
pub struct BoundingBox {
  x1: u32,
  y1: u32,
  x2: u32,
  y2: u32,
}

impl BoundingBox {
  pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Result<Self, InvalidBoundingBox> {
    if x1 >= x2 || y1 >= y2 {
      return Err(InvalidBoundingBox(x1, y1, x2, y2));
    }
    Ok(Self { x1, y1, x2, y2 })
  }

  /// 将浮点框截断为整数像素，并裁剪到 `[0, width-1] × [0, height-1]`
  ///
  /// 裁剪后退化为空框时返回 `None`。
  pub fn from_pixels(bbox: &[f32; 4], width: u32, height: u32) -> Option<Self> {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    let clamp = |v: f32, max: f32| {
      if v.is_nan() { 0 } else { v.clamp(0.0, max) as u32 }
    };
    Self::new(
      clamp(bbox[0], max_x),
      clamp(bbox[1], max_y),
      clamp(bbox[2], max_x),
      clamp(bbox[3], max_y),
    )
    .ok()
  }

  pub fn x1(&self) -> u32 {
    self.x1
  }

  pub fn y1(&self) -> u32 {
    self.y1
  }

  pub fn x2(&self) -> u32 {
    self.x2
  }

  pub fn y2(&self) -> u32 {
    self.y2
  }

  pub fn width(&self) -> u32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> u32 {
    self.y2 - self.y1
  }
}

impl TryFrom<[u32; 4]> for BoundingBox {
  type Error = InvalidBoundingBox;

  fn try_from([x1, y1, x2, y2]: [u32; 4]) -> Result<Self, Self::Error> {
    Self::new(x1, y1, x2, y2)
  }
}

impl From<BoundingBox> for [u32; 4] {
  fn from(bbox: BoundingBox) -> Self {
    [bbox.x1, bbox.y1, bbox.x2, bbox.y2]
  }
}

/// 单个检测目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub class_name: String,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

/// 一次推理调用的完整结果
///
/// `person_count` 是线上固定字段名，其含义为目标类别的检测数量，
/// 恒等于 `detected_objects.len()`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
  #[serde(deserialize_with = "deserialize_timestamp")]
  pub timestamp: DateTime<Utc>,
  pub person_count: usize,
  pub detected_objects: Vec<Detection>,
}

impl DetectionResponse {
  pub fn new(detected_objects: Vec<Detection>) -> Self {
    Self {
      timestamp: Utc::now(),
      person_count: detected_objects.len(),
      detected_objects,
    }
  }

  pub fn empty() -> Self {
    Self::new(Vec::new())
  }

  pub fn is_empty(&self) -> bool {
    self.detected_objects.is_empty()
  }
}

/// 接受带时区偏移的 RFC 3339 时间，以及不带偏移的 ISO-8601 本地时间（按 UTC 处理）
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  let text = String::deserialize(deserializer)?;
  if let Ok(timestamp) = DateTime::parse_from_rfc3339(&text) {
    return Ok(timestamp.with_timezone(&Utc));
  }
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|format| NaiveDateTime::parse_from_str(&text, format).ok())
    .map(|naive| naive.and_utc())
    .ok_or_else(|| de::Error::custom(format!("无效的时间戳: {}", text)))
}

/// 检测服务
///
/// 由进程显式构造一次，以引用（`Arc`）传给请求处理函数。
pub struct DetectionService<M> {
  model: M,
  target_class: String,
  target_id: u32,
}

impl<M: Model> DetectionService<M> {
  pub fn new(model: M, target_class: &str) -> Result<Self, ServiceError> {
    let target_id = model
      .labels()
      .iter()
      .position(|label| label == target_class)
      .ok_or_else(|| ServiceError::VocabularyMissing(target_class.to_string()))?;
    info!("目标类别 '{}' 的编号: {}", target_class, target_id);

    Ok(Self {
      model,
      target_class: target_class.to_string(),
      target_id: target_id as u32,
    })
  }

  pub fn target_class(&self) -> &str {
    &self.target_class
  }

  pub fn target_id(&self) -> u32 {
    self.target_id
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  /// 检测一张编码图像
  ///
  /// `threshold` 为严格下界：只保留 `confidence > threshold` 的目标类别检测。
  pub fn detect(&self, encoded: &[u8], threshold: f32) -> Result<DetectionResponse, ServiceError> {
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
      return Err(ServiceError::InvalidThreshold(threshold));
    }

    let frame = codec::decode(encoded)?;
    let (width, height) = (frame.width(), frame.height());

    let now = std::time::Instant::now();
    let items = self
      .model
      .infer(&frame, threshold)
      .map_err(|e| ServiceError::Inference(Box::new(e)))?;
    debug!(
      "推理完成，耗时: {:.2?}，候选框 {} 个",
      now.elapsed(),
      items.len()
    );

    let detected_objects: Vec<Detection> = items
      .iter()
      .filter(|item| item.class_id == self.target_id && item.score > threshold)
      .filter_map(|item| self.to_detection(item, width, height))
      .collect();

    Ok(DetectionResponse::new(detected_objects))
  }

  fn to_detection(&self, item: &DetectItem, width: u32, height: u32) -> Option<Detection> {
    match BoundingBox::from_pixels(&item.bbox, width, height) {
      Some(bbox) => Some(Detection {
        class_name: self.target_class.clone(),
        confidence: item.score.clamp(0.0, 1.0),
        bbox,
      }),
      None => {
        debug!("丢弃退化边界框: {:?}", item.bbox);
        None
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::{codec, frame::Frame};

  #[derive(Debug, thiserror::Error)]
  #[error("scripted failure")]
  pub struct ScriptedError;

  /// 返回固定候选框的模型
  pub struct ScriptedModel {
    pub labels: Vec<String>,
    pub items: Vec<DetectItem>,
    pub fail: bool,
  }

  impl ScriptedModel {
    pub fn new(items: Vec<DetectItem>) -> Self {
      Self {
        labels: vec!["car".into(), "person".into(), "dog".into()],
        items,
        fail: false,
      }
    }
  }

  impl Model for ScriptedModel {
    type Error = ScriptedError;

    fn labels(&self) -> &[String] {
      &self.labels
    }

    fn infer(&self, _frame: &Frame, min_score: f32) -> Result<Vec<DetectItem>, Self::Error> {
      if self.fail {
        return Err(ScriptedError);
      }
      Ok(
        self
          .items
          .iter()
          .filter(|item| item.score > min_score)
          .cloned()
          .collect(),
      )
    }
  }

  pub fn person(score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id: 1,
      score,
      bbox,
    }
  }

  fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let frame = Frame::filled(width, height, [90, 120, 150]).unwrap();
    codec::encode(&frame).unwrap().into_bytes()
  }

  #[test]
  fn test_missing_target_class_is_fatal() {
    let model = ScriptedModel::new(vec![]);
    assert!(matches!(
      DetectionService::new(model, "giraffe"),
      Err(ServiceError::VocabularyMissing(name)) if name == "giraffe"
    ));
  }

  #[test]
  fn test_target_class_resolved_once() {
    let service = DetectionService::new(ScriptedModel::new(vec![]), "person").unwrap();
    assert_eq!(service.target_id(), 1);
    assert_eq!(service.target_class(), "person");
  }

  #[test]
  fn test_count_matches_threshold_filter() {
    let model = ScriptedModel::new(vec![
      person(0.9, [10.0, 10.0, 50.0, 90.0]),
      person(0.8, [60.0, 10.0, 100.0, 90.0]),
      person(0.3, [110.0, 10.0, 150.0, 90.0]),
    ]);
    let service = DetectionService::new(model, "person").unwrap();
    let response = service.detect(&jpeg(200, 100), 0.5).unwrap();

    assert_eq!(response.person_count, 2);
    assert_eq!(response.detected_objects.len(), 2);
    assert!(
      response
        .detected_objects
        .iter()
        .all(|d| d.class_name == "person" && d.confidence > 0.5)
    );
  }

  #[test]
  fn test_threshold_is_strict_and_per_call() {
    let model = ScriptedModel::new(vec![
      person(0.5, [10.0, 10.0, 50.0, 90.0]),
      person(0.25, [60.0, 10.0, 100.0, 90.0]),
    ]);
    let service = DetectionService::new(model, "person").unwrap();
    let image = jpeg(200, 100);

    assert_eq!(service.detect(&image, 0.5).unwrap().person_count, 0);
    assert_eq!(service.detect(&image, 0.2).unwrap().person_count, 2);
  }

  #[test]
  fn test_other_classes_are_ignored() {
    let mut items = vec![person(0.9, [10.0, 10.0, 50.0, 90.0])];
    items.push(DetectItem {
      class_id: 0,
      score: 0.99,
      bbox: [0.0, 0.0, 20.0, 20.0],
    });
    let service = DetectionService::new(ScriptedModel::new(items), "person").unwrap();
    let response = service.detect(&jpeg(100, 100), 0.5).unwrap();
    assert_eq!(response.person_count, 1);
  }

  #[test]
  fn test_boxes_are_clamped_to_frame() {
    let model = ScriptedModel::new(vec![person(0.9, [-5.0, 3.7, 500.0, 99.9])]);
    let service = DetectionService::new(model, "person").unwrap();
    let response = service.detect(&jpeg(64, 48), 0.5).unwrap();
    let bbox = response.detected_objects[0].bbox;
    assert_eq!(<[u32; 4]>::from(bbox), [0, 3, 63, 47]);
  }

  #[test]
  fn test_degenerate_boxes_are_dropped() {
    let model = ScriptedModel::new(vec![
      person(0.9, [70.0, 10.0, 90.0, 20.0]),
      person(0.9, [10.0, 10.0, 10.5, 20.0]),
    ]);
    let service = DetectionService::new(model, "person").unwrap();
    let response = service.detect(&jpeg(64, 48), 0.5).unwrap();
    assert_eq!(response.person_count, 0);
    assert!(response.is_empty());
  }

  #[test]
  fn test_invalid_image_is_reported() {
    let service = DetectionService::new(ScriptedModel::new(vec![]), "person").unwrap();
    assert!(matches!(
      service.detect(b"not an image", 0.5),
      Err(ServiceError::InvalidImage(_))
    ));
    // 之后的调用不受影响
    assert!(service.detect(&jpeg(16, 16), 0.5).is_ok());
  }

  #[test]
  fn test_invalid_threshold() {
    let service = DetectionService::new(ScriptedModel::new(vec![]), "person").unwrap();
    for threshold in [-0.1, 1.5, f32::NAN] {
      assert!(matches!(
        service.detect(&jpeg(16, 16), threshold),
        Err(ServiceError::InvalidThreshold(_))
      ));
    }
  }

  #[test]
  fn test_inference_failure() {
    let mut model = ScriptedModel::new(vec![]);
    model.fail = true;
    let service = DetectionService::new(model, "person").unwrap();
    assert!(matches!(
      service.detect(&jpeg(16, 16), 0.5),
      Err(ServiceError::Inference(_))
    ));
  }

  #[test]
  fn test_bounding_box_wire_format() {
    let detection = Detection {
      class_name: "person".into(),
      confidence: 0.75,
      bbox: BoundingBox::new(1, 2, 30, 40).unwrap(),
    };
    let json = serde_json::to_value(&detection).unwrap();
    assert_eq!(json["bbox"], serde_json::json!([1, 2, 30, 40]));

    let bad = serde_json::json!({"class_name": "person", "confidence": 0.5, "bbox": [30, 2, 1, 40]});
    assert!(serde_json::from_value::<Detection>(bad).is_err());
  }

  #[test]
  fn test_response_wire_format() {
    let response = DetectionResponse::new(vec![Detection {
      class_name: "person".into(),
      confidence: 0.9,
      bbox: BoundingBox::new(0, 0, 10, 10).unwrap(),
    }]);
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["person_count"], 1);
    assert!(json["timestamp"].as_str().unwrap().contains('T'));
    assert_eq!(json["detected_objects"].as_array().unwrap().len(), 1);
  }

  #[test]
  fn test_timestamp_without_offset_is_accepted() {
    let naive = serde_json::json!({
      "timestamp": "2026-01-01T00:00:00.123456",
      "person_count": 0,
      "detected_objects": [],
    });
    let response: DetectionResponse = serde_json::from_value(naive).unwrap();
    assert_eq!(
      response.timestamp.to_rfc3339(),
      "2026-01-01T00:00:00.123456+00:00"
    );

    let offset = serde_json::json!({
      "timestamp": "2026-01-01T08:00:00+08:00",
      "person_count": 0,
      "detected_objects": [],
    });
    let response: DetectionResponse = serde_json::from_value(offset).unwrap();
    assert_eq!(response.timestamp.to_rfc3339(), "2026-01-01T00:00:00+00:00");

    let bad = serde_json::json!({
      "timestamp": "yesterday",
      "person_count": 0,
      "detected_objects": [],
    });
    assert!(serde_json::from_value::<DetectionResponse>(bad).is_err());
  }
}
