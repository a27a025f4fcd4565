use burn::tensor::TensorData;
use image::{RgbImage, imageops::FilterType};
use rand::seq::SliceRandom;

use crate::{
    config::TestConfig,
    error::{Error, Result},
    imdb::RoiRecord,
    network::ShapeSpec,
    shapes::ROI_WIDTH,
};

/// One network input batch: a single image at a single test scale.
#[derive(Debug, Clone)]
pub struct TestBatch {
    /// Position of the image in the roidb.
    pub image_index: usize,
    pub scale_index: usize,
    /// Factor from original image pixels to input pixels.
    pub im_scale: f32,
    /// Named inputs in binding order.
    pub inputs: Vec<(String, TensorData)>,
}

impl TestBatch {
    pub fn input(&self, name: &str) -> Option<&TensorData> {
        self.inputs.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn provide_data(&self) -> Vec<ShapeSpec> {
        self.inputs
            .iter()
            .map(|(name, t)| ShapeSpec::new(name.clone(), t.shape.clone()))
            .collect()
    }
}

/// Image preparation settings taken from [`TestConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderSettings {
    pub scales: Vec<(usize, usize)>,
    pub pixel_means: [f32; 3],
    /// Most proposals fed per image when proposals are external.
    pub proposal_cap: usize,
}

impl From<&TestConfig> for LoaderSettings {
    fn from(config: &TestConfig) -> Self {
        Self {
            scales: config.scales.clone(),
            pixel_means: config.pixel_means,
            proposal_cap: config.proposal_post_nms_top_n,
        }
    }
}

/// Restartable source of test batches over a roidb.
///
/// Every image is yielded once per configured scale, each time resized (aspect
/// preserved) to fit inside that scale's `(height, width)`.
pub struct TestLoader {
    roidb: Vec<RoiRecord>,
    has_rpn: bool,
    shuffle: bool,
    settings: LoaderSettings,
    order: Vec<usize>,
    cursor: usize,
    provide_data: Vec<ShapeSpec>,
}

impl TestLoader {
    pub fn new(
        roidb: Vec<RoiRecord>,
        batch_size: usize,
        shuffle: bool,
        has_rpn: bool,
        settings: LoaderSettings,
    ) -> Result<Self> {
        if batch_size != 1 {
            return Err(Error::Configuration(format!(
                "test batch size must be 1, got {batch_size}"
            )));
        }
        if roidb.is_empty() {
            return Err(Error::Configuration("test roidb is empty".into()));
        }
        if settings.scales.is_empty() {
            return Err(Error::Configuration("no test scales configured".into()));
        }

        let mut loader = Self {
            order: (0..roidb.len()).collect(),
            roidb,
            has_rpn,
            shuffle,
            settings,
            cursor: 0,
            provide_data: Vec::new(),
        };
        loader.reset();

        let first = loader.batch(loader.order[0], 0)?;
        loader.provide_data = first.provide_data();

        Ok(loader)
    }

    /// Input shapes of a representative (the first) batch.
    pub fn provide_data(&self) -> &[ShapeSpec] {
        &self.provide_data
    }

    /// Labels are never fed at test time.
    pub fn provide_label(&self) -> &[ShapeSpec] {
        &[]
    }

    pub fn data_names(&self) -> Vec<String> {
        self.provide_data.iter().map(|s| s.name.clone()).collect()
    }

    pub fn num_images(&self) -> usize {
        self.roidb.len()
    }

    pub fn num_scales(&self) -> usize {
        self.settings.scales.len()
    }

    pub fn roidb(&self) -> &[RoiRecord] {
        &self.roidb
    }

    /// Number of batches in a full pass.
    pub fn len(&self) -> usize {
        self.roidb.len() * self.settings.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restarts the pass, reshuffling when enabled.
    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut rand::rng());
        }
    }

    fn batch(&self, image_index: usize, scale_index: usize) -> Result<TestBatch> {
        let record = &self.roidb[image_index];
        let image = image::open(&record.image)?.to_rgb8();
        let (target_h, target_w) = self.settings.scales[scale_index];

        let (resized, im_scale) = resize_to_fit(&image, target_h, target_w);
        let (width, height) = resized.dimensions();

        let mut inputs = vec![(
            "data".to_string(),
            image_to_data(&resized, &self.settings.pixel_means),
        )];

        if self.has_rpn {
            inputs.push((
                "im_info".to_string(),
                TensorData::new(vec![height as f32, width as f32, im_scale], [1, 3]),
            ));
        } else {
            let proposals = record.proposals.as_ref().ok_or_else(|| {
                Error::Configuration(format!(
                    "{} has no proposals but the network takes external ROIs",
                    record.image.display()
                ))
            })?;
            inputs.push((
                "rois".to_string(),
                rois_to_data(
                    proposals,
                    im_scale,
                    self.settings.proposal_cap,
                    (image.width(), image.height()),
                ),
            ));
        }

        Ok(TestBatch {
            image_index,
            scale_index,
            im_scale,
            inputs,
        })
    }
}

impl Iterator for TestLoader {
    type Item = Result<TestBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.len() {
            return None;
        }

        let scales = self.settings.scales.len();
        let image_index = self.order[self.cursor / scales];
        let scale_index = self.cursor % scales;
        self.cursor += 1;

        Some(self.batch(image_index, scale_index))
    }
}

/// Resizes `image` so it fits inside `target_h` x `target_w`, keeping its
/// aspect ratio. Returns the resized image and the scale factor used.
pub fn resize_to_fit(image: &RgbImage, target_h: usize, target_w: usize) -> (RgbImage, f32) {
    let (w, h) = image.dimensions();
    let scale = (target_h as f32 / h as f32).min(target_w as f32 / w as f32);

    let new_h = ((h as f32 * scale).round() as usize).clamp(1, target_h) as u32;
    let new_w = ((w as f32 * scale).round() as usize).clamp(1, target_w) as u32;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    (resized, scale)
}

/// `[1, 3, H, W]` pixel data with the channel means removed.
pub fn image_to_data(image: &RgbImage, pixel_means: &[f32; 3]) -> TensorData {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut buf = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * w + x) as usize;
        for c in 0..3 {
            buf[c * plane + offset] = pixel[c] as f32 - pixel_means[c];
        }
    }

    TensorData::new(buf, [1, 3, h as usize, w as usize])
}

/// `[1, R, 5]` ROI rows `(0, x1, y1, x2, y2)` in input pixels.
///
/// At most `cap` proposals are kept. An image without proposals gets a single
/// whole-image ROI so the input is never empty.
pub fn rois_to_data(proposals: &[[f32; 4]], im_scale: f32, cap: usize, size: (u32, u32)) -> TensorData {
    let whole = [[0.0, 0.0, size.0 as f32 - 1.0, size.1 as f32 - 1.0]];
    let boxes = if proposals.is_empty() || cap == 0 {
        &whole[..]
    } else {
        &proposals[..proposals.len().min(cap)]
    };

    let mut buf = Vec::with_capacity(boxes.len() * ROI_WIDTH);
    for b in boxes {
        buf.push(0.0);
        buf.extend(b.iter().map(|v| v * im_scale));
    }

    TensorData::new(buf, [1, boxes.len(), ROI_WIDTH])
}
