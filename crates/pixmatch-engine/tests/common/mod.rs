#![allow(dead_code)]

//! Scripted face models for engine tests.
//!
//! Test photos are PNGs with faces painted as solid squares laid out every
//! [`SLOT`] pixels along the top. The bottom row carries the layout: pixel
//! `(1, h-1)` holds the face count, pixel `(SLOT*i + 2, h-1)` the side of
//! face `i`. The fake extractor turns a face's colour into its embedding, so
//! equal colours are the same person.

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use pixmatch_core::recognizer::checked_region;
use pixmatch_core::{
    BoundingBox, DetectorError, Embedding, EmbeddingExtract, FaceDetect, RecognizerError,
};
use pixmatch_engine::{Engine, EngineSettings, EventGallery};
use std::io::Cursor;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

pub const SLOT: u32 = 40;
const HEIGHT: u32 = 34;

pub const RED: [u8; 3] = [255, 0, 0];
/// Close enough to [`RED`] to match under the default threshold.
pub const REDDISH: [u8; 3] = [230, 60, 0];
pub const GREEN: [u8; 3] = [0, 255, 0];
pub const BLUE: [u8; 3] = [0, 0, 255];

pub struct Face {
    pub color: [u8; 3],
    pub side: u32,
}

pub fn face(color: [u8; 3]) -> Face {
    Face { color, side: 16 }
}

pub fn sized(color: [u8; 3], side: u32) -> Face {
    Face { color, side }
}

/// PNG bytes of a photo containing `faces`.
pub fn photo(faces: &[Face]) -> Vec<u8> {
    let width = SLOT * (faces.len() as u32).max(1);
    let mut image = RgbImage::new(width, HEIGHT);
    image.put_pixel(1, HEIGHT - 1, Rgb([faces.len() as u8, 0, 0]));
    for (i, f) in faces.iter().enumerate() {
        let x0 = SLOT * i as u32;
        for y in 0..f.side {
            for x in x0..x0 + f.side {
                image.put_pixel(x, y, Rgb(f.color));
            }
        }
        image.put_pixel(x0 + 2, HEIGHT - 1, Rgb([f.side as u8, 0, 0]));
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn photo_of(colors: &[[u8; 3]]) -> Vec<u8> {
    let faces: Vec<Face> = colors.iter().map(|&c| face(c)).collect();
    photo(&faces)
}

pub struct ColorDetector;

impl FaceDetect for ColorDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width < SLOT || height != HEIGHT {
            return Ok(Vec::new());
        }
        let count = image.get_pixel(1, height - 1)[0] as u32;
        Ok((0..count)
            .map(|i| {
                let side = image.get_pixel(SLOT * i + 2, height - 1)[0] as f32;
                BoundingBox {
                    x: (SLOT * i) as f32,
                    y: 0.0,
                    width: side,
                    height: side,
                    confidence: 0.9 - 0.05 * i as f32,
                    landmarks: None,
                }
            })
            .collect())
    }
}

pub struct ColorExtractor;

impl EmbeddingExtract for ColorExtractor {
    fn extract(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let region = checked_region(image, face)?;
        let cx = (region.x + region.width / 2.0) as u32;
        let cy = (region.y + region.height / 2.0) as u32;
        let Rgb([r, g, b]) = *image.get_pixel(cx, cy);
        Ok(Embedding::new(vec![
            r as f32 + 1.0,
            g as f32 + 1.0,
            b as f32 + 1.0,
        ]))
    }
}

/// Detector that takes `delay` before answering.
pub struct SlowDetector(pub Duration);

impl FaceDetect for SlowDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        std::thread::sleep(self.0);
        ColorDetector.detect(image)
    }
}

/// Detector that announces each call and waits for a release before answering.
pub struct GatedDetector {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

pub struct Gate {
    pub entered: mpsc::Receiver<()>,
    pub release: mpsc::Sender<()>,
}

pub fn gated() -> (GatedDetector, Gate) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    (
        GatedDetector {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        },
        Gate {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

impl Gate {
    /// Block until the detector has been called, off the async runtime.
    pub async fn wait_entered(&self) {
        tokio::task::block_in_place(|| self.entered.recv().unwrap());
    }
}

impl FaceDetect for GatedDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.entered.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        ColorDetector.detect(image)
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        model_timeout: Duration::from_secs(5),
        ..EngineSettings::default()
    }
}

pub fn engine() -> Engine {
    engine_with(Arc::new(ColorDetector), EventGallery::in_memory(), settings())
}

pub fn engine_with(
    detector: Arc<dyn FaceDetect>,
    gallery: EventGallery,
    settings: EngineSettings,
) -> Engine {
    Engine::new(detector, Arc::new(ColorExtractor), gallery, settings)
}
