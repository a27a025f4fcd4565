use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use burn::data::dataset::{
    Dataset,
    vision::{Annotation, BoundingBox, ImageFolderDataset},
};
use serde::Serialize;

use crate::{
    coco_labels::COCO_CATEGORIES,
    error::{Error, Result},
    imdb::{EvaluationResult, Imdb, RoiRecord},
    postprocess::{Detection, DetectionSet, area},
};

/// Upper area bounds of the small and medium COCO size ranges.
const SMALL_AREA: f32 = 32.0 * 32.0;
const MEDIUM_AREA: f32 = 96.0 * 96.0;

/// COCO category ids in contiguous class order, background (`0`) first.
pub fn coco_category_ids() -> Vec<usize> {
    std::iter::once(0)
        .chain(COCO_CATEGORIES.iter().map(|(id, _)| *id))
        .collect()
}

/// One entry of a COCO results file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CocoResult {
    pub image_id: u64,
    pub category_id: usize,
    /// `x, y, width, height`
    pub bbox: [f32; 4],
    pub score: f32,
}

/// COCO image set, e.g. `val2017`, read through burn's COCO detection loader.
///
/// Annotations are expected at `{dataset_path}/annotations/instances_{image_set}.json`
/// and images under `{dataset_path}/{image_set}/`. Proposal caches live in
/// `{root_path}/cache` and results are written to `{root_path}/results`.
pub struct CocoImdb {
    name: String,
    root_path: PathBuf,
    cache_path: PathBuf,
    classes: Vec<String>,
    category_ids: Vec<usize>,
    records: Vec<RoiRecord>,
    image_ids: Vec<u64>,
}

impl CocoImdb {
    pub fn open(image_set: &str, root_path: &Path, dataset_path: &Path) -> Result<Self> {
        let annotations = dataset_path
            .join("annotations")
            .join(format!("instances_{image_set}.json"));
        let images = dataset_path.join(image_set);

        let dataset = ImageFolderDataset::new_coco_detection(&annotations, &images).map_err(|e| {
            Error::Configuration(format!(
                "cannot read coco set {} / {}: {e:?}",
                annotations.display(),
                images.display()
            ))
        })?;

        let category_ids = coco_category_ids();
        let mut records = Vec::with_capacity(dataset.len());
        let mut image_ids = Vec::with_capacity(dataset.len());

        for index in 0..dataset.len() {
            let Some(item) = dataset.get(index) else {
                continue;
            };
            let image = PathBuf::from(&item.image_path);
            let (width, height) = image::image_dimensions(&image)?;

            let boxes: &[BoundingBox] = match &item.annotation {
                Annotation::BoundingBoxes(boxes) => boxes.as_slice(),
                _ => &[],
            };
            let (gt_boxes, gt_classes) = ground_truth(boxes, &category_ids);

            image_ids.push(image_id(&image, index));
            records.push(RoiRecord {
                image,
                height: height as usize,
                width: width as usize,
                gt_boxes,
                gt_classes,
                proposals: None,
            });
        }

        tracing::info!("coco_{image_set}: {} images", records.len());

        Ok(Self::with_records(image_set, root_path, records, image_ids))
    }

    /// Builds the image set from already loaded records.
    pub fn with_records(
        image_set: &str,
        root_path: &Path,
        records: Vec<RoiRecord>,
        image_ids: Vec<u64>,
    ) -> Self {
        let category_ids = coco_category_ids();
        let classes = std::iter::once("background")
            .chain(COCO_CATEGORIES.iter().map(|(_, name)| *name))
            .map(String::from)
            .collect();

        Self {
            name: format!("coco_{image_set}"),
            root_path: root_path.to_path_buf(),
            cache_path: root_path.join("cache"),
            classes,
            category_ids,
            records,
            image_ids,
        }
    }

    pub fn results_path(&self) -> PathBuf {
        self.root_path
            .join("results")
            .join(format!("detections_{}_results.json", self.name))
    }

    /// Flattens `detections` into COCO results entries.
    pub fn to_results(&self, detections: &DetectionSet) -> Vec<CocoResult> {
        let mut results = Vec::with_capacity(detections.total());

        for class in 1..detections.num_classes().min(self.category_ids.len()) {
            for (image, &image_id) in self.image_ids.iter().enumerate() {
                results.extend(detections.get(class, image).iter().map(|d| CocoResult {
                    image_id,
                    category_id: self.category_ids[class],
                    bbox: xyxy_to_xywh(&d.bbox),
                    score: d.score,
                }));
            }
        }

        results
    }

    fn write_results(&self, results: &[CocoResult]) -> Result<PathBuf> {
        let path = self.results_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        serde_json::to_writer(BufWriter::new(File::create(&path)?), results)?;
        tracing::info!("wrote {} detections to {}", results.len(), path.display());

        Ok(path)
    }
}

impl Imdb for CocoImdb {
    fn name(&self) -> &str {
        &self.name
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn gt_roidb(&self) -> Result<Vec<RoiRecord>> {
        Ok(self.records.clone())
    }

    /// Writes the detections in COCO results format for the official scorer.
    fn evaluate_detections(
        &self,
        detections: &DetectionSet,
        detailed_analysis: bool,
    ) -> Result<EvaluationResult> {
        if detections.num_images() != self.records.len() {
            return Err(Error::EvaluationFailure(format!(
                "{} images detected, {} in {}",
                detections.num_images(),
                self.records.len(),
                self.name
            )));
        }

        let results = self.to_results(detections);
        let results_file = self.write_results(&results)?;

        let size_breakdown = if detailed_analysis {
            let all: Vec<Detection> = (1..detections.num_classes())
                .flat_map(|c| (0..detections.num_images()).map(move |i| (c, i)))
                .flat_map(|(c, i)| detections.get(c, i).iter().copied())
                .collect();
            let gt_boxes: Vec<[f32; 4]> = self
                .records
                .iter()
                .flat_map(|r| r.gt_boxes.iter().zip(&r.gt_classes))
                .filter(|(_, class)| **class < detections.num_classes())
                .map(|(b, _)| *b)
                .collect();
            size_breakdown(&all, &gt_boxes)
        } else {
            Vec::new()
        };

        Ok(EvaluationResult {
            per_class_ap: None,
            size_breakdown,
            num_detections: results.len(),
            results_file: Some(results_file),
        })
    }
}

/// Ground truth boxes as `x1, y1, x2, y2` and their contiguous classes.
///
/// Boxes with a category outside the annotated set are dropped.
pub fn ground_truth(boxes: &[BoundingBox], category_ids: &[usize]) -> (Vec<[f32; 4]>, Vec<usize>) {
    boxes
        .iter()
        .filter_map(|b| {
            let class = category_ids.iter().position(|&id| id == b.label && id != 0)?;
            Some((xywh_to_xyxy(&b.coords), class))
        })
        .unzip()
}

pub fn xywh_to_xyxy(b: &[f32; 4]) -> [f32; 4] {
    [b[0], b[1], b[0] + (b[2] - 1.0).max(0.0), b[1] + (b[3] - 1.0).max(0.0)]
}

pub fn xyxy_to_xywh(b: &[f32; 4]) -> [f32; 4] {
    [b[0], b[1], b[2] - b[0] + 1.0, b[3] - b[1] + 1.0]
}

fn size_range(bbox: &[f32; 4]) -> usize {
    let a = area(bbox);
    if a < SMALL_AREA {
        0
    } else if a < MEDIUM_AREA {
        1
    } else {
        2
    }
}

/// Detection and ground truth counts per COCO size range, as `small`,
/// `medium`, `large` followed by `small_gt`, `medium_gt`, `large_gt`.
pub fn size_breakdown(detections: &[Detection], gt_boxes: &[[f32; 4]]) -> Vec<(String, f32)> {
    let mut detected = [0usize; 3];
    for d in detections {
        detected[size_range(&d.bbox)] += 1;
    }
    let mut annotated = [0usize; 3];
    for b in gt_boxes {
        annotated[size_range(b)] += 1;
    }

    let names = ["small", "medium", "large"];
    let detected = names.iter().zip(detected).map(|(name, n)| (name.to_string(), n as f32));
    let annotated = names
        .iter()
        .zip(annotated)
        .map(|(name, n)| (format!("{name}_gt"), n as f32));

    detected.chain(annotated).collect()
}

/// COCO file names are the zero padded image id; anything else falls back to
/// the position in the set.
fn image_id(path: &Path, index: usize) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(index as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RoiRecord {
        RoiRecord {
            image: "000000000139.jpg".into(),
            height: 100,
            width: 100,
            gt_boxes: vec![],
            gt_classes: vec![],
            proposals: None,
        }
    }

    #[test]
    fn test_eighty_classes_plus_background() {
        let ids = coco_category_ids();
        assert_eq!(ids.len(), 81);
        assert_eq!(ids[0], 0);
        assert_eq!(ids[1], 1);
        assert_eq!(ids[80], 90);
        assert!(!ids.contains(&12));

        let imdb = CocoImdb::with_records("val2017", Path::new("data"), vec![], vec![]);
        assert_eq!(imdb.num_classes(), 81);
        assert_eq!(imdb.classes()[0], "background");
        assert_eq!(imdb.classes()[1], "person");
        assert_eq!(imdb.classes()[80], "toothbrush");
    }

    #[test]
    fn test_ground_truth_converts_boxes_and_classes() {
        let boxes = vec![
            BoundingBox {
                coords: [10.0, 20.0, 5.0, 4.0],
                label: 13,
            },
            BoundingBox {
                coords: [0.0, 0.0, 1.0, 1.0],
                label: 12,
            },
        ];

        let (gt_boxes, gt_classes) = ground_truth(&boxes, &coco_category_ids());
        assert_eq!(gt_boxes, vec![[10.0, 20.0, 14.0, 23.0]]);
        // stop sign is the twelfth annotated category
        assert_eq!(gt_classes, vec![12]);
    }

    #[test]
    fn test_box_formats_are_inverse() {
        let b = [10.0, 20.0, 5.0, 4.0];
        assert_eq!(xyxy_to_xywh(&xywh_to_xyxy(&b)), b);
    }

    #[test]
    fn test_image_ids_come_from_file_names() {
        assert_eq!(image_id(Path::new("val2017/000000000139.jpg"), 4), 139);
        assert_eq!(image_id(Path::new("val2017/kitchen.jpg"), 4), 4);
    }

    #[test]
    fn test_evaluation_writes_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut annotated = record();
        annotated.gt_boxes = vec![[0.0, 0.0, 49.0, 49.0], [0.0, 0.0, 99.0, 99.0]];
        annotated.gt_classes = vec![1, 1];
        let imdb = CocoImdb::with_records("val2017", dir.path(), vec![annotated], vec![139]);

        let mut detections = DetectionSet::new(81, 1);
        detections.set(
            1,
            0,
            vec![Detection {
                bbox: [0.0, 0.0, 9.0, 19.0],
                score: 0.9,
            }],
        );

        let result = imdb.evaluate_detections(&detections, true).unwrap();
        assert_eq!(result.num_detections, 1);
        assert_eq!(result.per_class_ap, None);
        assert_eq!(
            result.size_breakdown,
            vec![
                ("small".to_string(), 1.0),
                ("medium".to_string(), 0.0),
                ("large".to_string(), 0.0),
                ("small_gt".to_string(), 0.0),
                ("medium_gt".to_string(), 1.0),
                ("large_gt".to_string(), 1.0),
            ]
        );

        let path = result.results_file.unwrap();
        let written: serde_json::Value =
            serde_json::from_reader(File::open(path).unwrap()).unwrap();
        assert_eq!(written[0]["image_id"], 139);
        assert_eq!(written[0]["category_id"], 1);
        assert_eq!(written[0]["bbox"][2], 10.0);
        assert_eq!(written[0]["bbox"][3], 20.0);
    }

    #[test]
    fn test_evaluation_rejects_image_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let imdb = CocoImdb::with_records("val2017", dir.path(), vec![record()], vec![139]);

        assert!(matches!(
            imdb.evaluate_detections(&DetectionSet::new(81, 2), false),
            Err(Error::EvaluationFailure(_))
        ));
    }
}
