//! Branding palettes from a logo image.
//!
//! Runs once per branding asset: dominant colours via k-means, then a day
//! (light) and a night (dark) palette with WCAG contrast adjustments.

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

type Rgb = [u8; 3];

const MAX_ANALYSIS_WIDTH: u32 = 500;
const KMEANS_SEED: u64 = 42;
const KMEANS_MAX_ITERATIONS: usize = 25;
const DEFAULT_CLUSTERS: usize = 5;
const GRAYSCALE_SPREAD: u8 = 15;
const WCAG_AA: f32 = 4.5;

const FALLBACK_PRIMARY: Rgb = [59, 130, 246];
const FALLBACK_SECONDARY: Rgb = [34, 197, 94];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    Day,
    Night,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    pub primary: String,
    pub primary_hover: String,
    pub secondary: String,
    pub bg: String,
    pub card_bg: String,
    pub text_primary: String,
    pub text_secondary: String,
    pub surface: String,
    pub accent: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemePalettes {
    pub light: Palette,
    pub dark: Palette,
}

impl ThemePalettes {
    pub fn for_mode(&self, mode: ThemeMode) -> &Palette {
        match mode {
            ThemeMode::Day => &self.light,
            ThemeMode::Night => &self.dark,
        }
    }
}

impl Default for ThemePalettes {
    fn default() -> Self {
        let p = |s: &str| s.to_string();
        Self {
            light: Palette {
                primary: p("#3b82f6"),
                primary_hover: p("#2563eb"),
                secondary: p("#22c55e"),
                bg: p("#ffffff"),
                card_bg: p("#f8fafc"),
                text_primary: p("#0f172a"),
                text_secondary: p("#475569"),
                surface: p("#e2e8f0"),
                accent: p("#f59e0b"),
                error: p("#dc2626"),
            },
            dark: Palette {
                primary: p("#3b82f6"),
                primary_hover: p("#2563eb"),
                secondary: p("#22c55e"),
                bg: p("#0f172a"),
                card_bg: p("#1e293b"),
                text_primary: p("#ffffff"),
                text_secondary: p("#94a3b8"),
                surface: p("#334155"),
                accent: p("#f59e0b"),
                error: p("#ef4444"),
            },
        }
    }
}

/// Derive day and night palettes from a logo.
pub fn analyze_logo(image: &RgbImage) -> ThemePalettes {
    let colors = dominant_colors(image, DEFAULT_CLUSTERS);
    tracing::debug!(colors = ?colors.iter().map(|c| to_hex(*c)).collect::<Vec<_>>(), "dominant colours");
    ThemePalettes {
        light: light_palette(&colors),
        dark: dark_palette(&colors),
    }
}

/// Cluster centres ordered by cluster population, most common first.
///
/// Pure black and pure white pixels are ignored. Returns the fallback primary
/// when fewer than `k` usable pixels remain.
pub fn dominant_colors(image: &RgbImage, k: usize) -> Vec<Rgb> {
    let k = k.max(1);
    let scaled;
    let image = if image.width() > MAX_ANALYSIS_WIDTH {
        let height = (image.height() as f32 * MAX_ANALYSIS_WIDTH as f32 / image.width() as f32)
            .round()
            .max(1.0) as u32;
        scaled = imageops::resize(image, MAX_ANALYSIS_WIDTH, height, FilterType::Lanczos3);
        &scaled
    } else {
        image
    };

    let pixels: Vec<[f32; 3]> = image
        .pixels()
        .map(|p| p.0)
        .filter(|c| *c != [0, 0, 0] && *c != [255, 255, 255])
        .map(|c| [c[0] as f32, c[1] as f32, c[2] as f32])
        .collect();

    if pixels.len() < k {
        return vec![FALLBACK_PRIMARY];
    }

    let (centres, counts) = kmeans(&pixels, k);
    let mut order: Vec<usize> = (0..centres.len()).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(a.cmp(&b)));
    order
        .into_iter()
        .filter(|&i| counts[i] > 0)
        .map(|i| centres[i].map(|v| v.round().clamp(0.0, 255.0) as u8))
        .collect()
}

fn distance_sq(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    (0..3).map(|c| (a[c] - b[c]).powi(2)).sum()
}

fn nearest(centres: &[[f32; 3]], p: &[f32; 3]) -> usize {
    centres
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| distance_sq(a, p).total_cmp(&distance_sq(b, p)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Lloyd's algorithm with k-means++ seeding from a fixed seed.
fn kmeans(pixels: &[[f32; 3]], k: usize) -> (Vec<[f32; 3]>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
    let mut centres = vec![pixels[rng.gen_range(0..pixels.len())]];

    while centres.len() < k {
        let weights: Vec<f32> = pixels
            .iter()
            .map(|p| distance_sq(&centres[nearest(&centres, p)], p))
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= 0.0 {
            break; // fewer distinct colours than clusters
        }
        let mut target = rng.gen_range(0.0..total);
        let pick = weights
            .iter()
            .position(|w| {
                target -= w;
                target <= 0.0
            })
            .unwrap_or(pixels.len() - 1);
        centres.push(pixels[pick]);
    }

    let mut labels = vec![usize::MAX; pixels.len()];
    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (label, p) in labels.iter_mut().zip(pixels) {
            let n = nearest(&centres, p);
            if *label != n {
                *label = n;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![[0.0f32; 3]; centres.len()];
        let mut counts = vec![0usize; centres.len()];
        for (&label, p) in labels.iter().zip(pixels) {
            counts[label] += 1;
            for c in 0..3 {
                sums[label][c] += p[c];
            }
        }
        for (i, centre) in centres.iter_mut().enumerate() {
            if counts[i] > 0 {
                *centre = sums[i].map(|s| s / counts[i] as f32);
            }
        }
    }

    let mut counts = vec![0usize; centres.len()];
    for &label in &labels {
        counts[label] += 1;
    }
    (centres, counts)
}

pub fn to_hex(c: Rgb) -> String {
    format!("#{:02x}{:02x}{:02x}", c[0], c[1], c[2])
}

fn from_hex(hex: &str) -> Option<Rgb> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

/// RGB → (hue°, saturation %, lightness %).
fn to_hsl(c: Rgb) -> (f32, f32, f32) {
    let [r, g, b] = c.map(|v| v as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    let delta = max - min;
    if delta == 0.0 {
        return (0.0, 0.0, l * 100.0);
    }

    let s = if l > 0.5 { delta / (2.0 - max - min) } else { delta / (max + min) };
    let h = if max == r {
        ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    (h * 60.0, s * 100.0, l * 100.0)
}

fn from_hsl(h: f32, s: f32, l: f32) -> Rgb {
    let (s, l) = (s / 100.0, l / 100.0);
    let chroma = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h.rem_euclid(360.0) / 60.0;
    let x = chroma * (1.0 - (hp.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = l - chroma / 2.0;
    [r, g, b].map(|v| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8)
}

/// WCAG relative luminance in [0, 1].
pub fn luminance(c: Rgb) -> f32 {
    let lin = |v: u8| {
        let v = v as f32 / 255.0;
        if v <= 0.03928 {
            v / 12.92
        } else {
            ((v + 0.055) / 1.055).powf(2.4)
        }
    };
    0.2126 * lin(c[0]) + 0.7152 * lin(c[1]) + 0.0722 * lin(c[2])
}

/// WCAG contrast ratio, 1.0 ..= 21.0.
pub fn contrast_ratio(a: Rgb, b: Rgb) -> f32 {
    let (la, lb) = (luminance(a), luminance(b));
    (la.max(lb) + 0.05) / (la.min(lb) + 0.05)
}

fn scale_lightness(c: Rgb, factor: f32) -> Rgb {
    let (h, s, l) = to_hsl(c);
    from_hsl(h, s, (l * factor).clamp(0.0, 100.0))
}

fn scale_saturation(c: Rgb, factor: f32) -> Rgb {
    let (h, s, l) = to_hsl(c);
    from_hsl(h, (s * factor).clamp(0.0, 100.0), l)
}

fn tint(c: Rgb, factor: f32) -> Rgb {
    c.map(|v| (v as f32 + (255.0 - v as f32) * factor) as u8)
}

fn shade(c: Rgb, factor: f32) -> Rgb {
    c.map(|v| (v as f32 * (1.0 - factor)) as u8)
}

fn is_grayscale(c: Rgb) -> bool {
    let max = c.iter().max().copied().unwrap_or(0);
    let min = c.iter().min().copied().unwrap_or(0);
    max - min < GRAYSCALE_SPREAD
}

fn vibrance(c: Rgb) -> f32 {
    let (_, s, l) = to_hsl(c);
    (s / 100.0) * (l / 100.0)
}

fn select_primary(colors: &[Rgb]) -> Rgb {
    colors
        .iter()
        .copied()
        .filter(|c| !is_grayscale(*c))
        .fold(None, |best: Option<Rgb>, c| match best {
            Some(b) if vibrance(b) >= vibrance(c) => Some(b),
            _ => Some(c),
        })
        .unwrap_or(FALLBACK_PRIMARY)
}

fn select_secondary(colors: &[Rgb], primary: Rgb) -> Rgb {
    let (primary_hue, _, _) = to_hsl(primary);
    let mut best = None;
    let mut best_diff = 0.0f32;

    for &c in colors {
        if c == primary || is_grayscale(c) {
            continue;
        }
        let (h, _, _) = to_hsl(c);
        let mut diff = (primary_hue - h).abs();
        if diff > 180.0 {
            diff = 360.0 - diff;
        }
        if diff > best_diff {
            best_diff = diff;
            best = Some(c);
        }
    }
    best.unwrap_or(FALLBACK_SECONDARY)
}

fn light_palette(colors: &[Rgb]) -> Palette {
    let base = select_primary(colors);
    let secondary = select_secondary(colors, base);

    let mut primary = base;
    if contrast_ratio(primary, [255, 255, 255]) < WCAG_AA {
        primary = scale_lightness(primary, 0.7);
    }

    Palette {
        primary: to_hex(primary),
        primary_hover: to_hex(scale_lightness(primary, 0.9)),
        secondary: to_hex(secondary),
        bg: to_hex(tint(primary, 0.98)),
        card_bg: "#ffffff".into(),
        text_primary: "#0f172a".into(),
        text_secondary: "#475569".into(),
        surface: to_hex(tint(primary, 0.95)),
        accent: to_hex(scale_saturation(primary, 1.2)),
        error: "#dc2626".into(),
    }
}

fn dark_palette(colors: &[Rgb]) -> Palette {
    let base = select_primary(colors);
    let secondary = select_secondary(colors, base);

    let mut primary = base;
    if luminance(base) < 0.3 {
        primary = scale_lightness(primary, 1.4);
    }
    let bg = shade(primary, 0.92);
    let hover = scale_lightness(primary, 0.9);
    let accent = scale_saturation(primary, 1.3);

    if contrast_ratio(primary, bg) < WCAG_AA {
        primary = scale_lightness(primary, 1.3);
    }

    Palette {
        primary: to_hex(primary),
        primary_hover: to_hex(hover),
        secondary: to_hex(secondary),
        bg: to_hex(bg),
        card_bg: to_hex(scale_lightness(bg, 1.5)),
        text_primary: "#f8fafc".into(),
        text_secondary: "#94a3b8".into(),
        surface: to_hex(scale_lightness(bg, 2.0)),
        accent: to_hex(accent),
        error: "#ef4444".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb as Px;

    #[test]
    fn test_hex_roundtrip() {
        assert_eq!(to_hex([59, 130, 246]), "#3b82f6");
        assert_eq!(from_hex("#3b82f6"), Some([59, 130, 246]));
        assert_eq!(from_hex("3b82"), None);
        assert_eq!(from_hex("#zz0000"), None);
    }

    #[test]
    fn test_contrast_black_white() {
        assert!((contrast_ratio([0, 0, 0], [255, 255, 255]) - 21.0).abs() < 0.01);
        assert!((contrast_ratio([10, 20, 30], [10, 20, 30]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_hsl_roundtrip() {
        for c in [[59, 130, 246], [239, 68, 68], [34, 197, 94], [128, 128, 128]] {
            let (h, s, l) = to_hsl(c);
            let back = from_hsl(h, s, l);
            for i in 0..3 {
                assert!((back[i] as i32 - c[i] as i32).abs() <= 1, "{c:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn test_dominant_colors_ordered_by_population() {
        // 3/4 red, 1/4 blue, with a white border that must be ignored
        let img = RgbImage::from_fn(40, 40, |x, y| {
            if x == 0 || y == 0 {
                Px([255, 255, 255])
            } else if x < 30 {
                Px([200, 30, 30])
            } else {
                Px([30, 30, 200])
            }
        });
        let colors = dominant_colors(&img, 2);
        assert_eq!(colors, vec![[200, 30, 30], [30, 30, 200]]);
    }

    #[test]
    fn test_dominant_colors_deterministic() {
        let img = RgbImage::from_fn(64, 64, |x, y| Px([(x * 4) as u8, (y * 4) as u8, 90]));
        assert_eq!(dominant_colors(&img, 5), dominant_colors(&img, 5));
    }

    #[test]
    fn test_dominant_colors_fallback_when_blank() {
        let img = RgbImage::from_pixel(10, 10, Px([255, 255, 255]));
        assert_eq!(dominant_colors(&img, 5), vec![FALLBACK_PRIMARY]);
    }

    #[test]
    fn test_primary_skips_grey() {
        let colors = [[120, 120, 120], [250, 40, 40], [40, 40, 120]];
        assert_eq!(select_primary(&colors), [250, 40, 40]);
        assert_eq!(select_primary(&[[10, 10, 10]]), FALLBACK_PRIMARY);
    }

    #[test]
    fn test_light_primary_readable_on_white() {
        // pale yellow has poor contrast on white and must be darkened
        let palette = light_palette(&[[250, 240, 120]]);
        let primary = from_hex(&palette.primary).unwrap();
        assert!(contrast_ratio(primary, [255, 255, 255]) > contrast_ratio([250, 240, 120], [255, 255, 255]));
        assert_eq!(palette.card_bg, "#ffffff");
    }

    #[test]
    fn test_dark_palette_background_is_dark() {
        let palette = dark_palette(&[[59, 130, 246], [34, 197, 94]]);
        let bg = from_hex(&palette.bg).unwrap();
        assert!(luminance(bg) < 0.05);
        assert_eq!(palette.secondary, "#22c55e");
    }

    #[test]
    fn test_analyze_two_colour_logo() {
        // red wordmark on a navy band, white margin
        let logo = RgbImage::from_fn(60, 20, |x, y| {
            if y < 2 {
                Px([255, 255, 255])
            } else if x < 40 {
                Px([200, 30, 30])
            } else {
                Px([30, 60, 160])
            }
        });
        let themes = analyze_logo(&logo);

        let day = themes.for_mode(ThemeMode::Day);
        assert_eq!(day.primary, "#c81e1e");
        assert_eq!(day.secondary, "#1e3ca0");
        let primary = from_hex(&day.primary).unwrap();
        assert!(contrast_ratio(primary, [255, 255, 255]) >= WCAG_AA);

        let night = themes.for_mode(ThemeMode::Night);
        assert_eq!(night.secondary, "#1e3ca0");
        assert!(luminance(from_hex(&night.bg).unwrap()) < 0.05);
        assert_eq!(analyze_logo(&logo), themes);
    }

    #[test]
    fn test_for_mode() {
        let themes = ThemePalettes::default();
        assert_eq!(themes.for_mode(ThemeMode::Day).bg, "#ffffff");
        assert_eq!(themes.for_mode(ThemeMode::Night).bg, "#0f172a");
    }
}
