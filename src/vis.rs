use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};

use crate::{
    config::TestConfig,
    error::{Error, Result},
    imdb::RoiRecord,
    postprocess::Detection,
};

/// Draws confident detections over their source images.
pub struct Visualizer {
    out_dir: PathBuf,
    thresh: f32,
    font: Option<FontVec>,
}

impl Visualizer {
    /// Images are written to `<root_path>/vis`. Labels are only drawn when
    /// `config.font_path` names a readable TrueType font.
    pub fn new(root_path: &Path, config: &TestConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => Some(load_font(Path::new(path))?),
            None => {
                tracing::warn!("no font configured, detections are drawn without labels");
                None
            }
        };

        let out_dir = root_path.join("vis");
        std::fs::create_dir_all(&out_dir)?;

        Ok(Self {
            out_dir,
            thresh: config.vis_thresh,
            font,
        })
    }

    /// Draws every detection scoring at least the visualization threshold and
    /// saves the result as `<out_dir>/<image stem>.jpg`.
    ///
    /// # Parameters
    ///
    /// * `record` – The image the detections belong to.
    /// * `per_class` – Detections by class index, background first.
    /// * `classes` – Class names indexed like `per_class`.
    ///
    /// # Returns
    ///
    /// The path of the written image.
    pub fn save(
        &self,
        record: &RoiRecord,
        per_class: &[Vec<Detection>],
        classes: &[String],
    ) -> Result<PathBuf> {
        let mut image = image::open(&record.image)?.to_rgb8();

        for (class, dets) in per_class.iter().enumerate().skip(1) {
            for d in dets.iter().filter(|d| d.score >= self.thresh) {
                let [x1, y1, x2, y2] = d.bbox;
                let rect = Rect::at(x1 as i32, y1 as i32)
                    .of_size(((x2 - x1) as u32).max(1), ((y2 - y1) as u32).max(1));
                let color = Rgb(complementary(&image, &d.bbox));

                draw_hollow_rect_mut(&mut image, rect, color);

                if let Some(font) = &self.font {
                    let name = classes.get(class).map(String::as_str).unwrap_or("?");
                    draw_text_mut(
                        &mut image,
                        color,
                        x1 as i32 + 5,
                        y1 as i32 + 5,
                        PxScale {
                            x: 12.4 * 1.5,
                            y: 12.4,
                        },
                        font,
                        &format!("{name} {:.3}", d.score),
                    );
                }
            }
        }

        let stem = record
            .image
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        let path = self.out_dir.join(format!("{stem}.jpg"));
        image.save(&path)?;

        Ok(path)
    }
}

pub fn load_font(path: &Path) -> Result<FontVec> {
    let bytes = std::fs::read(path)?;
    FontVec::try_from_vec(bytes)
        .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
}

/// Inverse of the mean colour under `bbox`, so outlines stand out from what
/// they enclose.
pub fn complementary(image: &RgbImage, bbox: &[f32; 4]) -> [u8; 3] {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return [255, 255, 255];
    }

    let x1 = (bbox[0].max(0.0) as u32).min(w - 1);
    let y1 = (bbox[1].max(0.0) as u32).min(h - 1);
    let x2 = (bbox[2].max(0.0) as u32).clamp(x1, w - 1);
    let y2 = (bbox[3].max(0.0) as u32).clamp(y1, h - 1);

    let mut sum = [0u64; 3];
    for y in y1..=y2 {
        for x in x1..=x2 {
            let p = image.get_pixel(x, y);
            for c in 0..3 {
                sum[c] += p[c] as u64;
            }
        }
    }

    let n = ((x2 - x1 + 1) * (y2 - y1 + 1)) as u64;
    sum.map(|s| 255 - (s / n) as u8)
}
