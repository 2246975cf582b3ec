//! Face detection.
//!
//! [`FaceDetect`] is the seam the pipelines depend on. [`ScrfdDetector`] implements
//! it with the SCRFD model (3-stride anchor decoding + NMS) on ONNX Runtime.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a decoded image.
///
/// An image without faces yields `Ok(vec![])`. Implementations return boxes
/// sorted by confidence, highest first.
pub trait FaceDetect: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Keep at most `max_faces` boxes, dropping the least confident ones.
pub fn cap_faces(mut faces: Vec<BoundingBox>, max_faces: usize) -> Vec<BoundingBox> {
    sort_by_confidence(&mut faces);
    if faces.len() > max_faces {
        tracing::debug!(found = faces.len(), kept = max_faces, "face cap reached");
        faces.truncate(max_faces);
    }
    faces
}

fn sort_by_confidence(faces: &mut [BoundingBox]) {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// Scale and padding applied when fitting an image into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    inner_w: u32,
    inner_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let inner_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let inner_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - inner_w) as f32 / 2.0,
            pad_y: (target - inner_h) as f32 / 2.0,
            inner_w,
            inner_h,
        }
    }

    /// Map a point in model-input space back to source image space.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let outputs = map_outputs(&output_names);
        tracing::debug!(?outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            outputs,
            confidence_threshold,
        })
    }

    /// Resize into the letterboxed 640×640 NCHW tensor SCRFD expects.
    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let (width, height) = image.dimensions();
        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let resized = imageops::resize(image, letterbox.inner_w, letterbox.inner_h, FilterType::Triangle);

        let size = SCRFD_INPUT_SIZE as usize;
        // Padding stays at 0.0, which is what SCRFD_MEAN normalizes to.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let off_x = letterbox.pad_x.floor() as usize;
        let off_y = letterbox.pad_y.floor() as usize;

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (off_x + x as usize, off_y + y as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetect for ScrfdDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = Self::preprocess(image);

        let mut session = self.session.lock().map_err(|_| DetectorError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let slots = self.outputs[level];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };

            let tensors = StrideTensors {
                scores: extract(slots.score, "scores")?,
                bboxes: extract(slots.bbox, "bboxes")?,
                kps: extract(slots.kps, "kps")?,
            };
            candidates.extend(tensors.decode(stride, &letterbox, self.confidence_threshold));
        }

        let mut faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        sort_by_confidence(&mut faces);
        Ok(faces)
    }
}

/// Find the score/bbox/kps tensors for each stride.
///
/// Exports that name their outputs `score_8`, `bbox_16`, `kps_32`, … are mapped
/// by name; anything else gets the standard order
/// `[0-2]` scores, `[3-5]` bboxes, `[6-8]` keypoints.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match by_name {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideOutputs { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Raw output slices for one stride level.
struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideTensors<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE as usize / stride;
        let grid_h = SCRFD_INPUT_SIZE as usize / stride;
        let step = stride as f32;

        (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
            .filter_map(|idx| {
                let score = self.scores.get(idx).copied()?;
                if score <= threshold {
                    return None;
                }

                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % grid_w) as f32 * step;
                let ay = (cell / grid_w) as f32 * step;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.to_source(ax - d[0] * step, ay - d[1] * step);
                let (x2, y2) = letterbox.to_source(ax + d[2] * step, ay + d[3] * step);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.to_source(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)
                    })
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Non-maximum suppression: greedily keep the most confident box of each overlapping cluster.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    sort_by_confidence(&mut candidates);

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
