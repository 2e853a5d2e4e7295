// 该文件是 Renliu （人流） 项目的一部分。
// tests/pipeline.rs - 端到端检测流程测试
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
  sync::Arc,
  time::{Duration, Instant},
};

use tokio::net::TcpListener;
use url::Url;

use renliu::{
  annotate::Annotator,
  batch::{BatchClient, BatchFailure, Upload},
  client::{ClientError, DetectOptions, DetectionBackend, HttpDetectionClient},
  codec,
  config::ServiceConfig,
  frame::Frame,
  model::{DetectItem, Model},
  server::{self, ErrorBody},
  service::{DetectionService, ServiceError},
  stream::StreamingClient,
};

#[derive(Debug, thiserror::Error)]
#[error("fixture model failure")]
struct FixtureError;

/// 返回固定候选框的模型，可选地模拟推理耗时
struct FixtureModel {
  labels: Vec<String>,
  items: Vec<DetectItem>,
  delay: Duration,
}

impl FixtureModel {
  fn people(scores: &[f32]) -> Self {
    let items = scores
      .iter()
      .enumerate()
      .map(|(i, score)| DetectItem {
        class_id: 0,
        score: *score,
        bbox: [i as f32 * 40.0 + 2.0, 10.0, i as f32 * 40.0 + 35.0, 110.0],
      })
      .chain(std::iter::once(DetectItem {
        class_id: 1,
        score: 0.99,
        bbox: [0.0, 0.0, 50.0, 50.0],
      }))
      .collect();
    Self {
      labels: vec!["person".into(), "chair".into()],
      items,
      delay: Duration::ZERO,
    }
  }

  fn slow(delay: Duration) -> Self {
    Self {
      delay,
      ..Self::people(&[0.9])
    }
  }
}

impl Model for FixtureModel {
  type Error = FixtureError;

  fn labels(&self) -> &[String] {
    &self.labels
  }

  fn infer(&self, _frame: &Frame, min_score: f32) -> Result<Vec<DetectItem>, Self::Error> {
    std::thread::sleep(self.delay);
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

async fn start(model: FixtureModel) -> Url {
  let service = Arc::new(DetectionService::new(model, "person").unwrap());
  let app = server::router(service, &ServiceConfig::default());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(server::serve(listener, app, std::future::pending()));
  Url::parse(&format!("http://{}/detect/", addr)).unwrap()
}

fn closed_endpoint() -> Url {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);
  Url::parse(&format!("http://{}/detect/", addr)).unwrap()
}

fn scene() -> Frame {
  Frame::filled(160, 120, [80, 80, 80]).unwrap()
}

#[tokio::test]
async fn test_batch_counts_people_above_threshold() {
  let endpoint = start(FixtureModel::people(&[0.9, 0.8, 0.3])).await;
  let backend = HttpDetectionClient::new(endpoint).unwrap();
  let mut client = BatchClient::new(backend, Annotator::new().unwrap());

  let state = client.submit(Upload::from_frame(scene()).unwrap()).await;
  let outcome = state.outcome().expect("batch should complete");

  assert_eq!(outcome.person_count, 2);
  assert_eq!(outcome.response.detected_objects.len(), 2);
  assert!(
    outcome
      .response
      .detected_objects
      .iter()
      .all(|d| d.class_name == "person" && d.confidence > 0.5)
  );
  assert_eq!(outcome.raw["detected_objects"].as_array().unwrap().len(), 2);
  assert_ne!(outcome.annotated, scene());
}

#[tokio::test]
async fn test_confidence_query_overrides_default() {
  let endpoint = start(FixtureModel::people(&[0.9, 0.8, 0.3])).await;
  let backend = HttpDetectionClient::new(endpoint).unwrap();
  let image = codec::encode(&scene()).unwrap();

  let response = backend
    .detect(image, DetectOptions::default().with_confidence(0.2))
    .await
    .unwrap();
  assert_eq!(response.person_count, 3);
}

#[tokio::test]
async fn test_invalid_image_is_structured_and_service_survives() {
  let endpoint = start(FixtureModel::people(&[0.9])).await;

  let form = reqwest::multipart::Form::new().part(
    "file",
    reqwest::multipart::Part::bytes(b"definitely not a jpeg".to_vec()).file_name("broken.jpg"),
  );
  let response = reqwest::Client::new()
    .post(endpoint.clone())
    .multipart(form)
    .send()
    .await
    .unwrap();
  assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
  let body: ErrorBody = response.json().await.unwrap();
  assert_eq!(body.error, ErrorBody::INVALID_IMAGE);

  let backend = HttpDetectionClient::new(endpoint).unwrap();
  let result = backend
    .detect(
      codec::EncodedImage::from_bytes(b"still broken".to_vec()),
      DetectOptions::default(),
    )
    .await;
  assert!(matches!(result, Err(ClientError::InvalidImage(_))));

  let response = backend
    .detect(codec::encode(&scene()).unwrap(), DetectOptions::default())
    .await
    .unwrap();
  assert_eq!(response.person_count, 1);
}

#[tokio::test]
async fn test_batch_reports_unreachable_service() {
  let backend = HttpDetectionClient::new(closed_endpoint()).unwrap();
  let mut client = BatchClient::new(backend, Annotator::new().unwrap());

  let state = client.submit(Upload::from_frame(scene()).unwrap()).await;
  assert!(matches!(
    state.failure(),
    Some(BatchFailure::ServiceUnreachable { .. })
  ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_passes_through_on_timeout() {
  let endpoint = start(FixtureModel::slow(Duration::from_secs(2))).await;
  let backend = Arc::new(HttpDetectionClient::new(endpoint).unwrap());
  let deadline = Duration::from_millis(300);
  let client = StreamingClient::new(backend, Annotator::new().unwrap(), deadline, 0.5);

  let input = scene();
  let started = Instant::now();
  let output = client.process(input.clone()).await;

  assert_eq!(output, input);
  assert!(started.elapsed() < deadline + Duration::from_millis(700));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_one_frame_per_frame() {
  let endpoint = start(FixtureModel::people(&[0.9])).await;
  let backend = Arc::new(HttpDetectionClient::new(endpoint).unwrap());
  let client = StreamingClient::new(
    backend,
    Annotator::new().unwrap(),
    Duration::from_secs(5),
    0.5,
  );

  let mut emitted = 0;
  for _ in 0..4 {
    let output = client.process(scene()).await;
    assert_eq!((output.width(), output.height()), (160, 120));
    assert_ne!(output, scene());
    emitted += 1;
  }
  assert_eq!(emitted, 4);
  assert_eq!(client.stats().annotated, 4);

  let unreachable = StreamingClient::new(
    Arc::new(HttpDetectionClient::new(closed_endpoint()).unwrap()),
    Annotator::new().unwrap(),
    Duration::from_secs(1),
    0.5,
  );
  assert_eq!(unreachable.process(scene()).await, scene());
}

#[test]
fn test_codec_round_trip_keeps_detections() {
  let frame = scene();
  let decoded = codec::decode(codec::encode(&frame).unwrap().as_bytes()).unwrap();
  assert_eq!((decoded.width(), decoded.height()), (160, 120));

  let service = DetectionService::new(FixtureModel::people(&[0.9, 0.8, 0.3]), "person").unwrap();
  let direct = service
    .detect(codec::encode(&frame).unwrap().as_bytes(), 0.5)
    .unwrap();
  let round_trip = service
    .detect(codec::encode(&decoded).unwrap().as_bytes(), 0.5)
    .unwrap();
  assert_eq!(direct.detected_objects, round_trip.detected_objects);
}

#[test]
fn test_missing_vocabulary_is_fatal() {
  let result = DetectionService::new(FixtureModel::people(&[]), "bicycle");
  assert!(matches!(result, Err(ServiceError::VocabularyMissing(_))));
}
