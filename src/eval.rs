use crate::{
    config::{RunOptions, TestConfig},
    engine::Predictor,
    error::{Error, Result},
    imdb::{EvaluationResult, Imdb},
    loader::TestLoader,
    postprocess::{Detection, DetectionSet, RefineSettings, limit_per_image, refine_class},
    stats::EvalStats,
    vis::Visualizer,
};

/// Post-processing applied to every image of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSettings {
    pub refine: RefineSettings,
    pub max_per_image: usize,
    pub detailed_analysis: bool,
}

impl EvalSettings {
    pub fn new(options: &RunOptions, config: &TestConfig) -> Self {
        Self {
            refine: RefineSettings {
                score_thresh: options.thresh,
                nms_thresh: config.nms_thresh,
                voting_thresh: options.use_box_voting.then_some(config.box_voting_thresh),
            },
            max_per_image: config.max_per_image,
            detailed_analysis: options.detailed_analysis,
        }
    }
}

/// Runs every batch of `loader` through `predictor` and scores the result
/// with `imdb`.
///
/// Detections of all scales of an image are merged in original image
/// coordinates before per-class thresholding, NMS and optional box voting.
/// At most `max_per_image` detections per image survive.
pub fn pred_eval<P: Predictor>(
    predictor: &mut P,
    loader: &mut TestLoader,
    imdb: &dyn Imdb,
    settings: &EvalSettings,
    visualizer: Option<&Visualizer>,
    stats: &mut EvalStats,
) -> Result<EvaluationResult> {
    let num_classes = imdb.num_classes();
    let num_scales = loader.num_scales();
    let mut all = DetectionSet::new(num_classes, loader.num_images());
    let mut candidates: Vec<Vec<Detection>> = vec![Vec::new(); num_classes];

    loader.reset();
    while let Some(batch) = loader.next() {
        let batch = batch?;
        if batch.scale_index == 0 {
            stats.start();
        }

        let raw = predictor.predict(&batch)?;
        if raw.num_classes() != num_classes {
            return Err(Error::EvaluationFailure(format!(
                "network scored {} classes, {} has {num_classes}",
                raw.num_classes(),
                imdb.name()
            )));
        }

        for (class, dets) in candidates.iter_mut().enumerate().skip(1) {
            dets.extend(raw.candidates(class, batch.im_scale));
        }

        if batch.scale_index + 1 < num_scales {
            continue;
        }

        let mut per_class: Vec<Vec<Detection>> = candidates
            .iter_mut()
            .enumerate()
            .map(|(class, dets)| {
                let pooled = std::mem::take(dets);
                if class == 0 {
                    Vec::new()
                } else {
                    refine_class(&pooled, &settings.refine)
                }
            })
            .collect();
        limit_per_image(&mut per_class, settings.max_per_image);

        let found: usize = per_class.iter().map(Vec::len).sum();
        stats.update(batch.image_index, found)?;

        if let Some(vis) = visualizer {
            let record = &loader.roidb()[batch.image_index];
            vis.save(record, &per_class, imdb.classes())?;
        }

        for (class, dets) in per_class.into_iter().enumerate() {
            all.set(class, batch.image_index, dets);
        }
    }

    let result = imdb.evaluate_detections(&all, settings.detailed_analysis)?;

    stats.flush(&format!(
        "{}: {} detections{}",
        imdb.name(),
        result.num_detections,
        result
            .results_file
            .as_ref()
            .map(|p| format!(", results in {}", p.display()))
            .unwrap_or_default()
    ))?;

    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        engine::RawDetections,
        imdb::RoiRecord,
        loader::{LoaderSettings, TestBatch, tests::write_image},
    };
    use std::{
        cell::RefCell,
        path::{Path, PathBuf},
    };

    /// Two-class dataset that keeps the detections it is asked to score.
    pub struct RecordingImdb {
        pub classes: Vec<String>,
        pub roidb: Vec<RoiRecord>,
        pub cache: PathBuf,
        pub scored: RefCell<Option<DetectionSet>>,
    }

    impl RecordingImdb {
        pub fn new(roidb: Vec<RoiRecord>, cache: &Path) -> Self {
            Self {
                classes: vec!["background".into(), "thing".into()],
                roidb,
                cache: cache.to_path_buf(),
                scored: RefCell::new(None),
            }
        }
    }

    impl Imdb for RecordingImdb {
        fn name(&self) -> &str {
            "recording"
        }

        fn classes(&self) -> &[String] {
            &self.classes
        }

        fn cache_path(&self) -> &Path {
            &self.cache
        }

        fn gt_roidb(&self) -> Result<Vec<RoiRecord>> {
            Ok(self.roidb.clone())
        }

        fn evaluate_detections(
            &self,
            detections: &DetectionSet,
            detailed_analysis: bool,
        ) -> Result<EvaluationResult> {
            *self.scored.borrow_mut() = Some(detections.clone());
            Ok(EvaluationResult {
                per_class_ap: Some(vec![0.5, 0.7]),
                size_breakdown: if detailed_analysis {
                    vec![("small".into(), 1.0)]
                } else {
                    vec![]
                },
                num_detections: detections.total(),
                results_file: None,
            })
        }
    }

    /// Reports the same object at every scale, expressed in input pixels,
    /// plus a faint second box.
    pub struct FixedObject {
        pub calls: usize,
    }

    impl Predictor for FixedObject {
        fn predict(&mut self, batch: &TestBatch) -> Result<RawDetections> {
            self.calls += 1;
            let s = batch.im_scale;
            let object = [2.0 * s, 2.0 * s, 12.0 * s, 12.0 * s];
            let faint = [0.0, 0.0, 1.0, 1.0];

            RawDetections::new(
                2,
                vec![0.1, 0.8, 0.9, 0.0005],
                vec![object, object, faint, faint],
            )
        }
    }

    fn settings(voting: Option<f32>) -> EvalSettings {
        EvalSettings {
            refine: RefineSettings {
                score_thresh: 1e-3,
                nms_thresh: 0.3,
                voting_thresh: voting,
            },
            max_per_image: 100,
            detailed_analysis: true,
        }
    }

    fn loader(dir: &Path, scales: Vec<(usize, usize)>) -> TestLoader {
        let roidb = vec![
            write_image(dir, "a.png", 20, 20),
            write_image(dir, "b.png", 20, 20),
        ];
        TestLoader::new(
            roidb,
            1,
            false,
            true,
            LoaderSettings {
                scales,
                pixel_means: [0.0; 3],
                proposal_cap: 10,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_scales_merge_into_one_detection_per_object() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(dir.path(), vec![(20, 20), (40, 40)]);
        let imdb = RecordingImdb::new(loader.roidb().to_vec(), dir.path());
        let mut stats = EvalStats::new(&dir.path().join("log.txt"), 2, "test").unwrap();
        let mut predictor = FixedObject { calls: 0 };

        let result = pred_eval(
            &mut predictor,
            &mut loader,
            &imdb,
            &settings(None),
            None,
            &mut stats,
        )
        .unwrap();

        assert_eq!(predictor.calls, 4);
        assert_eq!(result.num_detections, 2);
        assert_eq!(result.size_breakdown.len(), 1);

        let scored = imdb.scored.borrow();
        let scored = scored.as_ref().unwrap();
        for image in 0..2 {
            let dets = scored.get(1, image);
            assert_eq!(dets.len(), 1);
            assert_eq!(dets[0].bbox, [2.0, 2.0, 12.0, 12.0]);
            assert_eq!(dets[0].score, 0.8);
            assert!(scored.get(0, image).is_empty());
        }
    }

    #[test]
    fn test_threshold_drops_faint_detections() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(dir.path(), vec![(20, 20)]);
        let imdb = RecordingImdb::new(loader.roidb().to_vec(), dir.path());
        let mut stats = EvalStats::new(&dir.path().join("log.txt"), 2, "test").unwrap();

        let mut s = settings(Some(0.8));
        s.refine.score_thresh = 0.85;
        let result = pred_eval(
            &mut FixedObject { calls: 0 },
            &mut loader,
            &imdb,
            &s,
            None,
            &mut stats,
        )
        .unwrap();

        assert_eq!(result.num_detections, 0);
    }

    #[test]
    fn test_class_count_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = loader(dir.path(), vec![(20, 20)]);
        let mut imdb = RecordingImdb::new(loader.roidb().to_vec(), dir.path());
        imdb.classes.push("other".into());
        let mut stats = EvalStats::new(&dir.path().join("log.txt"), 2, "test").unwrap();

        assert!(matches!(
            pred_eval(
                &mut FixedObject { calls: 0 },
                &mut loader,
                &imdb,
                &settings(None),
                None,
                &mut stats,
            ),
            Err(Error::EvaluationFailure(_))
        ));
    }

    #[test]
    fn test_settings_follow_options() {
        let cmd: crate::config::TestCmd =
            argh::FromArgs::from_args(&["test_rcnn"], &["--use-box-voting", "--thresh", "0.05"])
                .unwrap();
        let options = RunOptions::try_from(&cmd).unwrap();
        let s = EvalSettings::new(&options, &TestConfig::new());

        assert_eq!(s.refine.voting_thresh, Some(0.8));
        assert_eq!(s.refine.score_thresh, 0.05);
        assert_eq!(s.max_per_image, 100);
    }
}
