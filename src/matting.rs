use config_model::ViewerConfig;
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Sampling edge length used when computing mat colours.
const SAMPLE_EDGE: u32 = 64;

/// Image-derived part of the auto-mat, cached with the record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatDescriptor {
    /// Alpha-weighted mean colour of the whole picture.
    pub average_rgb: [u8; 3],
    /// Mean colour of the outermost pixel ring, used to extend edges.
    pub edge_rgb: [u8; 3],
    /// Display aspect ratio (width / height) after orientation.
    pub aspect_ratio: f32,
}

/// Everything the renderer needs to draw the mat around one picture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatTreatment {
    pub descriptor: MatDescriptor,
    pub blur_amount: f32,
    pub blur_zoom: f32,
    pub blur_edges: bool,
    pub edge_alpha: f32,
    pub background: [f32; 4],
}

impl MatDescriptor {
    pub fn compute(img: &DynamicImage, orientation: u8) -> Self {
        let sample = img.thumbnail(SAMPLE_EDGE, SAMPLE_EDGE).to_rgba8();
        let (w, h) = (img.width().max(1), img.height().max(1));
        let aspect_ratio = if matches!(orientation, 5..=8) {
            h as f32 / w as f32
        } else {
            w as f32 / h as f32
        };
        Self {
            average_rgb: average_color(&sample),
            edge_rgb: edge_color(&sample),
            aspect_ratio,
        }
    }

    pub fn treatment(self, viewer: &ViewerConfig) -> MatTreatment {
        MatTreatment {
            descriptor: self,
            blur_amount: viewer.blur_amount,
            blur_zoom: viewer.blur_zoom,
            blur_edges: viewer.blur_edges,
            edge_alpha: viewer.edge_alpha,
            background: viewer.background,
        }
    }
}

fn average_color(img: &RgbaImage) -> [u8; 3] {
    weighted_mean(img.pixels().map(|p| p.0))
}

fn edge_color(img: &RgbaImage) -> [u8; 3] {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return [0, 0, 0];
    }
    let ring = img
        .enumerate_pixels()
        .filter(|(x, y, _)| *x == 0 || *y == 0 || *x == w - 1 || *y == h - 1)
        .map(|(_, _, p)| p.0);
    weighted_mean(ring)
}

fn weighted_mean(pixels: impl Iterator<Item = [u8; 4]>) -> [u8; 3] {
    let mut r: u64 = 0;
    let mut g: u64 = 0;
    let mut b: u64 = 0;
    let mut weight: u64 = 0;
    for [pr, pg, pb, pa] in pixels {
        let a = u64::from(pa);
        r += u64::from(pr) * a;
        g += u64::from(pg) * a;
        b += u64::from(pb) * a;
        weight += a;
    }
    if weight == 0 {
        return [0, 0, 0];
    }
    [(r / weight) as u8, (g / weight) as u8, (b / weight) as u8]
}
