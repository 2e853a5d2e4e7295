// 该文件是 Renliu （人流） 项目的一部分。
// src/model/yolo.rs - YOLOv8 ONNX 检测模型
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
  sync::{Mutex, MutexGuard},
};

use image::{Rgb, RgbImage, imageops::FilterType};
use ort::{session::Session, value::Tensor};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  model::{DetectItem, Model, coco_labels, load_labels, nms},
};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_IOU_THRESHOLD: f32 = 0.45;
const YOLO_MAX_DETECTIONS: usize = 300;
const YOLO_PAD_VALUE: u8 = 114;
// 输出前 4 个特征为 cx, cy, w, h
const YOLO_BOX_FEATURES: usize = 4;

#[derive(Error, Debug)]
pub enum YoloError {
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("词表加载错误: {0}")]
  LabelLoadError(#[from] std::io::Error),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(String),
  #[error("模型输出形状不符: {0}")]
  OutputShape(String),
}

impl YoloError {
  fn ort(e: impl std::fmt::Display) -> Self {
    YoloError::OrtError(e.to_string())
  }
}

/// YOLOv8 模型构建器
///
/// URL 形式：`onnx:///path/yolov8n.onnx?labels=/path/labels.txt&size=640&iou=0.45`
pub struct YoloModelBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  input_size: u32,
  iou_threshold: f32,
}

impl FromUrlWithScheme for YoloModelBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for YoloModelBuilder {
  type Error = YoloError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(YoloError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = YoloModelBuilder {
      model_path: PathBuf::from(crate::url_file_path(url)),
      labels_path: None,
      input_size: YOLO_INPUT_SIZE,
      iou_threshold: YOLO_IOU_THRESHOLD,
    };

    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "labels" => builder.labels_path = Some(PathBuf::from(v.as_ref())),
        "size" => {
          builder.input_size = v
            .parse()
            .map_err(|_| YoloError::ModelPathError(format!("无效的输入尺寸: {}", v)))?
        }
        "iou" => {
          builder.iou_threshold = v
            .parse()
            .map_err(|_| YoloError::ModelPathError(format!("无效的 IoU 阈值: {}", v)))?
        }
        _ => debug!("忽略未知模型参数: {}={}", k, v),
      }
    }

    Ok(builder)
  }
}

impl YoloModelBuilder {
  pub fn build(self) -> Result<YoloModel, YoloError> {
    info!("加载模型文件: {}", self.model_path.display());
    let session = Session::builder()
      .map_err(YoloError::ort)?
      .commit_from_file(&self.model_path)
      .map_err(YoloError::ort)?;
    info!("模型加载完成");

    let labels = match &self.labels_path {
      Some(path) => {
        info!("加载词表文件: {}", path.display());
        load_labels(path)?
      }
      None => coco_labels(),
    };
    debug!("词表大小: {}", labels.len());

    Ok(YoloModel {
      session: Mutex::new(session),
      labels,
      input_size: self.input_size,
      iou_threshold: self.iou_threshold,
    })
  }
}

/// YOLOv8 ONNX 模型
///
/// 推理会话每次运行需要独占访问，由内部互斥锁保护；对调用方而言模型只读。
pub struct YoloModel {
  session: Mutex<Session>,
  labels: Vec<String>,
  input_size: u32,
  iou_threshold: f32,
}

/// letterbox 变换参数，用于把输出坐标映射回原图
#[derive(Debug, Clone, Copy)]
struct Letterbox {
  ratio: f32,
  pad_x: f32,
  pad_y: f32,
}

fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
  let (w, h) = image.dimensions();
  let ratio = (size as f32 / w as f32).min(size as f32 / h as f32);
  let new_w = ((w as f32 * ratio).round() as u32).clamp(1, size);
  let new_h = ((h as f32 * ratio).round() as u32).clamp(1, size);
  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

  let pad_x = (size - new_w) / 2;
  let pad_y = (size - new_h) / 2;
  let mut canvas = RgbImage::from_pixel(size, size, Rgb([YOLO_PAD_VALUE; 3]));
  image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

  (
    canvas,
    Letterbox {
      ratio,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
    },
  )
}

/// 上一次推理中途 panic 不影响后续调用，会话本身无跨调用状态
fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
  session.lock().unwrap_or_else(|poisoned| {
    warn!("推理会话锁已损坏，继续使用");
    poisoned.into_inner()
  })
}

/// HWC u8 -> NCHW f32 / 255
fn to_nchw_tensor(image: &RgbImage) -> Vec<f32> {
  let (w, h) = image.dimensions();
  let plane = (w * h) as usize;
  let mut data = vec![0f32; plane * 3];
  for (idx, pixel) in image.pixels().enumerate() {
    data[idx] = pixel[0] as f32 / 255.0;
    data[plane + idx] = pixel[1] as f32 / 255.0;
    data[2 * plane + idx] = pixel[2] as f32 / 255.0;
  }
  data
}

/// 解析 `[1, 4 + C, N]`（或转置的 `[1, N, 4 + C]`）输出
fn decode_output(
  shape: &[i64],
  data: &[f32],
  num_classes: usize,
  min_score: f32,
) -> Result<Vec<(u32, f32, [f32; 4])>, YoloError> {
  if shape.len() != 3 || shape.iter().any(|&d| d <= 0) {
    return Err(YoloError::OutputShape(format!("{:?}", shape)));
  }

  let features = YOLO_BOX_FEATURES + num_classes;
  let (a, b) = (shape[1] as usize, shape[2] as usize);
  let (anchors, feature_major) = if a == features {
    (b, true)
  } else if b == features {
    (a, false)
  } else {
    return Err(YoloError::OutputShape(format!(
      "{:?}，词表大小为 {}",
      shape, num_classes
    )));
  };
  // 按 (anchor, feature) 读取
  let at = |i: usize, f: usize| {
    if feature_major {
      data[f * anchors + i]
    } else {
      data[i * features + f]
    }
  };

  if data.len() < anchors * features {
    return Err(YoloError::OutputShape(format!(
      "数据长度 {} 小于 {}",
      data.len(),
      anchors * features
    )));
  }

  let mut candidates = Vec::new();
  for i in 0..anchors {
    let mut best_class = 0usize;
    let mut best_score = f32::MIN;
    for c in 0..num_classes {
      let score = at(i, YOLO_BOX_FEATURES + c);
      if score > best_score {
        best_score = score;
        best_class = c;
      }
    }
    if best_score <= min_score {
      continue;
    }

    let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
    candidates.push((
      best_class as u32,
      best_score,
      [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
    ));
  }

  Ok(candidates)
}

impl Model for YoloModel {
  type Error = YoloError;

  fn labels(&self) -> &[String] {
    &self.labels
  }

  fn infer(&self, frame: &Frame, min_score: f32) -> Result<Vec<DetectItem>, Self::Error> {
    let (input, lb) = letterbox(frame.as_rgb_image(), self.input_size);
    let size = self.input_size as usize;
    let tensor =
      Tensor::from_array(([1usize, 3, size, size], to_nchw_tensor(&input))).map_err(YoloError::ort)?;

    debug!("执行模型推理");
    let candidates = {
      let mut session = lock_session(&self.session);
      let outputs = session
        .run(ort::inputs![tensor])
        .map_err(YoloError::ort)?;
      let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(YoloError::ort)?;
      decode_output(shape, data, self.labels.len(), min_score)?
    };
    debug!("候选框数量: {}", candidates.len());

    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let items = candidates
      .into_iter()
      .map(|(class_id, score, [x1, y1, x2, y2])| DetectItem {
        class_id,
        score,
        bbox: [
          ((x1 - lb.pad_x) / lb.ratio).clamp(0.0, fw),
          ((y1 - lb.pad_y) / lb.ratio).clamp(0.0, fh),
          ((x2 - lb.pad_x) / lb.ratio).clamp(0.0, fw),
          ((y2 - lb.pad_y) / lb.ratio).clamp(0.0, fh),
        ],
      })
      .collect();

    let kept = nms(items, self.iou_threshold, YOLO_MAX_DETECTIONS);
    debug!("检测到 {} 个物体", kept.len());
    Ok(kept)
  }
}
