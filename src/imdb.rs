use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    coco::CocoImdb,
    config::{DatasetKind, ProposalSource},
    error::{Error, Result},
    postprocess::DetectionSet,
};

/// One test image with its ground truth and, for external-proposal runs, its
/// proposals. Boxes are `x1, y1, x2, y2` in original image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiRecord {
    pub image: PathBuf,
    pub height: usize,
    pub width: usize,
    #[serde(default)]
    pub gt_boxes: Vec<[f32; 4]>,
    #[serde(default)]
    pub gt_classes: Vec<usize>,
    #[serde(default)]
    pub proposals: Option<Vec<[f32; 4]>>,
}

/// Aggregate outcome of scoring a detection run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    /// Average precision per foreground class, for datasets scored in-process.
    pub per_class_ap: Option<Vec<f32>>,
    /// Scores broken down by object-size range, when detailed analysis ran.
    pub size_breakdown: Vec<(String, f32)>,
    pub num_detections: usize,
    /// Detections written for external scoring tools.
    pub results_file: Option<PathBuf>,
}

impl EvaluationResult {
    pub fn mean_ap(&self) -> Option<f32> {
        self.per_class_ap
            .as_ref()
            .filter(|ap| !ap.is_empty())
            .map(|ap| ap.iter().sum::<f32>() / ap.len() as f32)
    }

    /// The single number a run reports for `dataset`.
    ///
    /// Only ImageNet reduces its per-class APs to a mean; other datasets
    /// report through their own tooling and yield `None`.
    pub fn summary_for(&self, dataset: DatasetKind) -> Result<Option<f32>> {
        match dataset {
            DatasetKind::ImageNet => self.mean_ap().map(Some).ok_or_else(|| {
                Error::EvaluationFailure("imagenet scoring produced no per-class AP".into())
            }),
            DatasetKind::Coco => Ok(None),
        }
    }
}

/// A test dataset: ground truth, proposals and scoring.
pub trait Imdb {
    fn name(&self) -> &str;

    /// Class names, background first.
    fn classes(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.classes().len()
    }

    /// Directory holding cached proposal files.
    fn cache_path(&self) -> &Path;

    fn gt_roidb(&self) -> Result<Vec<RoiRecord>>;

    /// Attaches proposals from `<cache>/<name>_<source>_roidb.json`, a JSON
    /// list with one box list per image in `gt_roidb` order.
    fn proposal_roidb(
        &self,
        source: ProposalSource,
        gt_roidb: Vec<RoiRecord>,
    ) -> Result<Vec<RoiRecord>> {
        let path = self
            .cache_path()
            .join(format!("{}_{}_roidb.json", self.name(), source.token()));
        let file = File::open(&path).map_err(|e| {
            Error::Configuration(format!("cannot open proposals {}: {e}", path.display()))
        })?;
        let proposals: Vec<Vec<[f32; 4]>> = serde_json::from_reader(BufReader::new(file))?;

        tracing::info!("loaded {} proposals from {}", source.token(), path.display());
        attach_proposals(gt_roidb, proposals)
    }

    /// Scores every detection of the run.
    fn evaluate_detections(
        &self,
        detections: &DetectionSet,
        detailed_analysis: bool,
    ) -> Result<EvaluationResult>;
}

/// Opens the `image_set` of `dataset`.
pub fn open_imdb(
    dataset: DatasetKind,
    image_set: &str,
    root_path: &Path,
    dataset_path: &Path,
) -> Result<Box<dyn Imdb>> {
    match dataset {
        DatasetKind::Coco => Ok(Box::new(CocoImdb::open(image_set, root_path, dataset_path)?)),
        DatasetKind::ImageNet => Err(Error::Configuration(
            "no imagenet dataset reader is built into this binary".into(),
        )),
    }
}

pub fn attach_proposals(
    gt_roidb: Vec<RoiRecord>,
    proposals: Vec<Vec<[f32; 4]>>,
) -> Result<Vec<RoiRecord>> {
    if gt_roidb.len() != proposals.len() {
        return Err(Error::Configuration(format!(
            "proposal file covers {} images, dataset has {}",
            proposals.len(),
            gt_roidb.len()
        )));
    }

    Ok(gt_roidb
        .into_iter()
        .zip(proposals)
        .map(|(mut rec, boxes)| {
            rec.proposals = Some(boxes);
            rec
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> RoiRecord {
        RoiRecord {
            image: name.into(),
            height: 10,
            width: 20,
            gt_boxes: vec![],
            gt_classes: vec![],
            proposals: None,
        }
    }

    #[test]
    fn test_attach_proposals_keeps_order() {
        let roidb = attach_proposals(
            vec![record("a.jpg"), record("b.jpg")],
            vec![vec![[0.0, 0.0, 5.0, 5.0]], vec![]],
        )
        .unwrap();

        assert_eq!(roidb[0].proposals.as_ref().unwrap().len(), 1);
        assert_eq!(roidb[1].proposals, Some(vec![]));
    }

    #[test]
    fn test_attach_proposals_rejects_length_mismatch() {
        assert!(matches!(
            attach_proposals(vec![record("a.jpg")], vec![]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_imagenet_reader_is_not_built_in() {
        assert!(matches!(
            open_imdb(DatasetKind::ImageNet, "val", Path::new("data"), Path::new("data/imagenet")),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_imagenet_summary_is_mean_ap() {
        let result = EvaluationResult {
            per_class_ap: Some(vec![0.5, 0.25, 0.75]),
            ..Default::default()
        };

        assert_eq!(result.summary_for(DatasetKind::ImageNet).unwrap(), Some(0.5));
        assert_eq!(result.summary_for(DatasetKind::Coco).unwrap(), None);
    }

    #[test]
    fn test_imagenet_without_ap_fails() {
        assert!(matches!(
            EvaluationResult::default().summary_for(DatasetKind::ImageNet),
            Err(Error::EvaluationFailure(_))
        ));
    }
}
