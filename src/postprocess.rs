//! Per-class detection filtering: thresholding, greedy NMS and box voting.
//!
//! Boxes are `[x1, y1, x2, y2]` in original image pixels with inclusive pixel
//! extents, so a box from 0 to 9 is 10 pixels wide.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
}

/// Detections of a whole run, indexed `[class][image]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSet {
    num_images: usize,
    boxes: Vec<Vec<Vec<Detection>>>,
}

impl DetectionSet {
    pub fn new(num_classes: usize, num_images: usize) -> Self {
        Self {
            num_images,
            boxes: vec![vec![Vec::new(); num_images]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.boxes.len()
    }

    pub fn num_images(&self) -> usize {
        self.num_images
    }

    pub fn get(&self, class: usize, image: usize) -> &[Detection] {
        &self.boxes[class][image]
    }

    pub fn set(&mut self, class: usize, image: usize, detections: Vec<Detection>) {
        self.boxes[class][image] = detections;
    }

    /// Number of detections across every class and image.
    pub fn total(&self) -> usize {
        self.boxes
            .iter()
            .flat_map(|per_image| per_image.iter())
            .map(Vec::len)
            .sum()
    }
}

pub fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0] + 1.0).max(0.0) * (b[3] - b[1] + 1.0).max(0.0)
}

/// Intersection over union of two boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0]) + 1.0).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1]) + 1.0).max(0.0);
    let inter = iw * ih;
    let union = area(a) + area(b) - inter;

    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy non-maximum suppression.
///
/// Returns the indices of the kept detections, highest score first.
pub fn nms(dets: &[Detection], thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..dets.len()).collect();
    order.sort_by(|&a, &b| dets[b].score.total_cmp(&dets[a].score));

    let mut suppressed = vec![false; dets.len()];
    let mut keep = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in order[pos + 1..].iter() {
            if !suppressed[j] && iou(&dets[i].bbox, &dets[j].bbox) > thresh {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Replaces each kept box with the score-weighted mean of every box in `all`
/// overlapping it by at least `thresh`. Scores are unchanged.
pub fn box_voting(kept: &[Detection], all: &[Detection], thresh: f32) -> Vec<Detection> {
    kept.iter()
        .map(|k| {
            let mut acc = [0.0f32; 4];
            let mut weight = 0.0f32;

            for d in all.iter().filter(|d| iou(&k.bbox, &d.bbox) >= thresh) {
                for (a, v) in acc.iter_mut().zip(d.bbox.iter()) {
                    *a += v * d.score;
                }
                weight += d.score;
            }

            if weight <= 0.0 {
                return *k;
            }

            Detection {
                bbox: acc.map(|v| v / weight),
                score: k.score,
            }
        })
        .collect()
}

/// Settings for [`refine_class`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineSettings {
    pub score_thresh: f32,
    pub nms_thresh: f32,
    /// IoU threshold for box voting, or `None` to skip voting.
    pub voting_thresh: Option<f32>,
}

/// Filters one class's candidate detections of one image.
pub fn refine_class(candidates: &[Detection], settings: &RefineSettings) -> Vec<Detection> {
    let above: Vec<Detection> = candidates
        .iter()
        .filter(|d| d.score > settings.score_thresh)
        .copied()
        .collect();

    let kept: Vec<Detection> = nms(&above, settings.nms_thresh)
        .into_iter()
        .map(|i| above[i])
        .collect();

    match settings.voting_thresh {
        Some(t) => box_voting(&kept, &above, t),
        None => kept,
    }
}

/// Keeps at most `max_per_image` detections of one image across all classes
/// (index 0, the background, is ignored).
pub fn limit_per_image(per_class: &mut [Vec<Detection>], max_per_image: usize) {
    let mut scores: Vec<f32> = per_class
        .iter()
        .skip(1)
        .flat_map(|dets| dets.iter().map(|d| d.score))
        .collect();

    if scores.len() <= max_per_image {
        return;
    }
    if max_per_image == 0 {
        per_class.iter_mut().for_each(Vec::clear);
        return;
    }

    scores.sort_by(|a, b| b.total_cmp(a));
    let cutoff = scores[max_per_image - 1];

    for dets in per_class.iter_mut().skip(1) {
        dets.retain(|d| d.score >= cutoff);
    }
}
