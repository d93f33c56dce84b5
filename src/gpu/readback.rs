//! Host copy of a traced output image.

use std::path::Path;

use crate::util::{Error, Result, UVec2, Vec3};

/// rgba32float pixels, row-major, row 0 at the top.
///
/// rgb holds the shaded color; alpha holds the distance from the camera to
/// the hit point, or a negative value for background pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputImage {
    pub size: UVec2,
    pub pixels: Vec<[f32; 4]>,
}

impl OutputImage {
    pub fn new(size: UVec2) -> Self {
        Self {
            size,
            pixels: vec![[0.0; 4]; (size.x * size.y) as usize],
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[(y * self.size.x + x) as usize]
    }

    pub fn color(&self, x: u32, y: u32) -> Vec3 {
        let p = self.pixel(x, y);
        Vec3::new(p[0], p[1], p[2])
    }

    /// Hit distance at a pixel, `None` for background.
    pub fn hit_distance(&self, x: u32, y: u32) -> Option<f32> {
        let d = self.pixel(x, y)[3];
        (d >= 0.0).then_some(d)
    }

    /// Number of pixels that hit geometry.
    pub fn hit_count(&self) -> usize {
        self.pixels.iter().filter(|p| p[3] >= 0.0).count()
    }

    /// 8-bit sRGB-encoded copy with opaque alpha.
    pub fn to_rgba8(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.size.x, self.size.y, |x, y| {
            let p = self.pixel(x, y);
            let enc = |c: f32| (linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0 + 0.5) as u8;
            image::Rgba([enc(p[0]), enc(p[1]), enc(p[2]), 255])
        })
    }

    /// Save as PNG (8-bit) or EXR (float, distance in alpha) by extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => self.to_rgba8().save(path)?,
            Some("exr") => {
                let raw: Vec<f32> = self.pixels.iter().flatten().copied().collect();
                let img = image::Rgba32FImage::from_raw(self.size.x, self.size.y, raw)
                    .ok_or_else(|| Error::backend("output image size mismatch"))?;
                image::DynamicImage::ImageRgba32F(img).save(path)?;
            }
            _ => {
                return Err(Error::degenerate(format!(
                    "unsupported image extension: {}",
                    path.display()
                )))
            }
        }
        Ok(())
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_distance() {
        let mut img = OutputImage::new(UVec2::new(2, 2));
        img.pixels[1] = [1.0, 0.0, 0.0, 2.5];
        img.pixels[2] = [0.0, 0.0, 0.0, -1.0];
        assert_eq!(img.hit_distance(1, 0), Some(2.5));
        assert_eq!(img.hit_distance(0, 1), None);
        assert_eq!(img.color(1, 0), Vec3::X);
    }

    #[test]
    fn test_save_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let mut img = OutputImage::new(UVec2::new(4, 3));
        img.pixels[5] = [1.0, 0.5, 0.0, 1.0];
        img.save(&path).unwrap();
        let back = image::open(&path).unwrap().to_rgba8();
        assert_eq!(back.dimensions(), (4, 3));
        assert_eq!(back.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn test_save_rejects_unknown_extension() {
        let img = OutputImage::new(UVec2::new(1, 1));
        assert!(img.save(Path::new("out.bmp")).is_err());
    }
}
