//! Canonical 112×112 face crops for the recognizer.
//!
//! With landmarks, faces are warped onto the InsightFace reference points by a
//! least-squares similarity transform (scale, rotation, translation). Without
//! landmarks, the box is squared up and resized.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// `dst = [a -b; b a] · src + t`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Closed form on centred coordinates; degenerate input (all source points
    /// coincident) yields the identity.
    fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }

        if energy < 1e-12 {
            return Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        }
    }

    /// Map an output-space point back into the source image.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Bilinear RGB sample; pixels outside the image read as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let texel = |px: i64, py: i64| -> [f32; 3] {
        if px >= 0 && px < w && py >= 0 && py < h {
            let p = image.get_pixel(px as u32, py as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr) = (texel(x0, y0), texel(x0 + 1, y0));
    let (bl, br) = (texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

fn warp(image: &RgbImage, transform: &Similarity, out_size: u32) -> RgbImage {
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        match transform.invert_point(ox as f32, oy as f32) {
            Some((sx, sy)) => sample(image, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    })
}

/// Warp a face onto the canonical ArcFace landmark layout.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    warp(image, &transform, ALIGNED_SIZE)
}

/// Square crop around a face box, resized to 112×112.
///
/// The caller guarantees `face` already lies inside the image (see
/// [`BoundingBox::clipped_to`]).
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let (w, h) = image.dimensions();
    let side = face.width.max(face.height).min(w.min(h) as f32).max(1.0);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x = (cx - side / 2.0).clamp(0.0, w as f32 - side) as u32;
    let y = (cy - side / 2.0).clamp(0.0, h as f32 - side) as u32;
    let side = side as u32;

    let crop = imageops::crop_imm(image, x, y, side, side).to_image();
    imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_transform() {
        let src: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS_112[i];
            (x * 2.0 + 10.0, y * 2.0 - 4.0)
        });
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);
    }

    #[test]
    fn test_rotated_transform() {
        // dst is src rotated 90° about the origin: (x, y) → (-y, x)
        let src = REFERENCE_LANDMARKS_112;
        let dst: [(f32, f32); 5] = std::array::from_fn(|i| (-src[i].1, src[i].0));
        let t = Similarity::estimate(&src, &dst);
        assert!(t.a.abs() < 1e-4, "a = {}", t.a);
        assert!((t.b - 1.0).abs() < 1e-4, "b = {}", t.b);
    }

    #[test]
    fn test_degenerate_landmarks_fall_back_to_identity() {
        let src = [(5.0, 5.0); 5];
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(t, Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 });
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut frame = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // 5x5 red patch on the left eye
        for dy in 0..5 {
            for dx in 0..5 {
                frame.put_pixel(78 + dx, 58 + dy, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&frame, &src);
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let brightest = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "expected red patch near ({rx}, {ry}), max={brightest}");
    }

    #[test]
    fn test_crop_face_output_size() {
        let frame = RgbImage::from_pixel(300, 200, Rgb([1, 2, 3]));
        let face = BoundingBox {
            x: 250.0, y: 150.0, width: 50.0, height: 40.0, confidence: 0.9, landmarks: None,
        };
        let crop = crop_face(&frame, &face);
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }
}
