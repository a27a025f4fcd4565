use std::{fmt, path::PathBuf, str::FromStr};

use argh::FromArgs;
use burn::config::Config;

use crate::error::{self, Error};

pub const CONFIG_PATH: &str = "./config/test_config.json";
pub const SYMBOL_DIR: &str = "./symbols";
pub const LOG_PATH: &str = "./artifacts/test_log.txt";

/// Settings shared by every stage of a test run.
///
/// Loaded once in `main` and passed by reference into each component; no
/// component reads settings from anywhere else.
#[derive(Config, Debug)]
pub struct TestConfig {
    /// Candidate test resolutions as `(height, width)` pairs.
    #[config(default = "vec![(600, 1000)]")]
    pub scales: Vec<(usize, usize)>,
    #[config(default = 81)]
    pub num_classes: usize,
    /// Proposals kept after NMS when the proposals are externally supplied.
    #[config(default = 2000)]
    pub proposal_post_nms_top_n: usize,
    /// Extra ROI slots added on top of `proposal_post_nms_top_n`.
    #[config(default = 30)]
    pub roi_margin: usize,
    /// RGB means subtracted from every pixel.
    #[config(default = "[123.68, 116.779, 103.939]")]
    pub pixel_means: [f32; 3],
    #[config(default = 0.3)]
    pub nms_thresh: f32,
    #[config(default = 0.8)]
    pub box_voting_thresh: f32,
    #[config(default = 100)]
    pub max_per_image: usize,
    #[config(default = 0.7)]
    pub vis_thresh: f32,
    /// TrueType font used to label visualized detections.
    pub font_path: Option<String>,
}

impl TestConfig {
    /// Loads the config at `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &str) -> error::Result<Self> {
        if !std::path::Path::new(path).exists() {
            tracing::warn!("no test config at {}, using defaults", path);
            return Ok(TestConfig::new());
        }

        TestConfig::load(path).map_err(|e| Error::Configuration(format!("{path}: {e:?}")))
    }
}

/// Architectural variant of the detector under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Plain,
    GlobalContext,
    RoiAlign,
    GlobalContextRoiAlign,
}

impl Variant {
    pub fn from_flags(use_global_context: bool, use_roi_align: bool) -> Self {
        match (use_global_context, use_roi_align) {
            (false, false) => Variant::Plain,
            (true, false) => Variant::GlobalContext,
            (false, true) => Variant::RoiAlign,
            (true, true) => Variant::GlobalContextRoiAlign,
        }
    }

    pub fn uses_global_context(&self) -> bool {
        matches!(self, Variant::GlobalContext | Variant::GlobalContextRoiAlign)
    }

    pub fn uses_roi_align(&self) -> bool {
        matches!(self, Variant::RoiAlign | Variant::GlobalContextRoiAlign)
    }

    /// Suffix appended to a builder entry point for this variant.
    pub fn suffix(&self) -> &'static str {
        match self {
            Variant::Plain => "",
            Variant::GlobalContext => "_gc",
            Variant::RoiAlign => "_align",
            Variant::GlobalContextRoiAlign => "_gc_align",
        }
    }
}

/// Where externally supplied proposals come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalSource {
    SelectiveSearch,
    Rpn,
}

impl ProposalSource {
    /// Token used in proposal cache file names.
    pub fn token(&self) -> &'static str {
        match self {
            ProposalSource::SelectiveSearch => "ss",
            ProposalSource::Rpn => "rpn",
        }
    }
}

impl FromStr for ProposalSource {
    type Err = Error;

    fn from_str(s: &str) -> error::Result<Self> {
        match s {
            "ss" | "selective_search" | "selective-search" => Ok(ProposalSource::SelectiveSearch),
            "rpn" => Ok(ProposalSource::Rpn),
            other => Err(Error::Configuration(format!(
                "unknown proposal source '{other}', expected 'ss' or 'rpn'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Coco,
    ImageNet,
}

impl FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "coco" => Ok(DatasetKind::Coco),
            "imagenet" => Ok(DatasetKind::ImageNet),
            other => Err(Error::Configuration(format!("unknown dataset '{other}'"))),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetKind::Coco => write!(f, "coco"),
            DatasetKind::ImageNet => write!(f, "imagenet"),
        }
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Test a Fast R-CNN / FPN network
pub struct TestCmd {
    #[argh(option, default = "String::from(\"resnet_fpn\")")]
    /// network name
    pub network: String,
    #[argh(option, default = "String::from(\"coco\")")]
    /// dataset name
    pub dataset: String,
    #[argh(option, default = "String::from(\"val2017\")")]
    /// image_set name
    pub image_set: String,
    #[argh(option, default = "String::from(\"data\")")]
    /// output data folder
    pub root_path: String,
    #[argh(option, default = "String::from(\"data/coco\")")]
    /// dataset path
    pub dataset_path: String,
    #[argh(option, default = "String::from(\"model/resnet_fpn\")")]
    /// model to test with
    pub prefix: String,
    #[argh(option, default = "0")]
    /// model epoch to test with
    pub epoch: usize,
    #[argh(option, default = "0")]
    /// GPU device to test with
    pub gpu: usize,
    #[argh(switch)]
    /// turn on visualization
    pub vis: bool,
    #[argh(option, default = "1e-3")]
    /// valid detection threshold
    pub thresh: f32,
    #[argh(switch)]
    /// shuffle data on visualization
    pub shuffle: bool,
    #[argh(switch)]
    /// generate proposals on the fly
    pub has_rpn: bool,
    #[argh(option, default = "String::from(\"rpn\")")]
    /// can be ss for selective search or rpn
    pub proposal: String,
    #[argh(switch)]
    /// use roi global context for classification
    pub use_global_context: bool,
    #[argh(switch)]
    /// replace ROIPooling with ROIAlign
    pub use_roi_align: bool,
    #[argh(switch)]
    /// use box voting in test
    pub use_box_voting: bool,
    #[argh(switch)]
    /// give detailed analysis result, e.g. APs in different scale ranges
    pub detailed_analysis: bool,
    #[argh(option, default = "String::from(CONFIG_PATH)")]
    /// test config file (JSON)
    pub config: String,
    #[argh(option, default = "String::from(SYMBOL_DIR)")]
    /// directory holding network declaration manifests
    pub symbol_dir: String,
}

/// Validated, typed form of the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub network: String,
    pub dataset: DatasetKind,
    pub image_set: String,
    pub root_path: PathBuf,
    pub dataset_path: PathBuf,
    pub prefix: String,
    pub epoch: usize,
    pub gpu: usize,
    pub vis: bool,
    pub thresh: f32,
    pub shuffle: bool,
    pub has_rpn: bool,
    pub proposal: ProposalSource,
    pub variant: Variant,
    pub use_box_voting: bool,
    pub detailed_analysis: bool,
    pub symbol_dir: PathBuf,
}

impl TryFrom<&TestCmd> for RunOptions {
    type Error = Error;

    fn try_from(cmd: &TestCmd) -> error::Result<Self> {
        if !(0.0..=1.0).contains(&cmd.thresh) {
            return Err(Error::Configuration(format!(
                "detection threshold {} outside [0, 1]",
                cmd.thresh
            )));
        }

        Ok(RunOptions {
            network: cmd.network.clone(),
            dataset: cmd.dataset.parse()?,
            image_set: cmd.image_set.clone(),
            root_path: cmd.root_path.clone().into(),
            dataset_path: cmd.dataset_path.clone().into(),
            prefix: cmd.prefix.clone(),
            epoch: cmd.epoch,
            gpu: cmd.gpu,
            vis: cmd.vis,
            thresh: cmd.thresh,
            shuffle: cmd.shuffle,
            has_rpn: cmd.has_rpn,
            proposal: cmd.proposal.parse()?,
            variant: Variant::from_flags(cmd.use_global_context, cmd.use_roi_align),
            use_box_voting: cmd.use_box_voting,
            detailed_analysis: cmd.detailed_analysis,
            symbol_dir: cmd.symbol_dir.clone().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> TestCmd {
        TestCmd::from_args(&["test_rcnn"], args).unwrap()
    }

    #[test]
    fn test_defaults_match_reference_driver() {
        let c = cmd(&[]);
        assert_eq!(c.network, "resnet_fpn");
        assert_eq!(c.proposal, "rpn");
        assert!((c.thresh - 1e-3).abs() < f32::EPSILON);
        assert!(!c.has_rpn);
    }

    #[test]
    fn test_flags_resolve_into_variant() {
        let c = cmd(&["--use-global-context", "--use-roi-align", "--has-rpn"]);
        let opts = RunOptions::try_from(&c).unwrap();
        assert_eq!(opts.variant, Variant::GlobalContextRoiAlign);
        assert!(opts.variant.uses_global_context());
        assert!(opts.variant.uses_roi_align());
        assert!(opts.has_rpn);
    }

    #[test]
    fn test_invalid_proposal_source_is_configuration_error() {
        let c = cmd(&["--proposal", "edgeboxes"]);
        assert!(matches!(
            RunOptions::try_from(&c),
            Err(Error::Configuration(msg)) if msg.contains("edgeboxes")
        ));
    }

    #[test]
    fn test_proposal_source_spellings() {
        assert_eq!("ss".parse::<ProposalSource>().unwrap(), ProposalSource::SelectiveSearch);
        assert_eq!(
            "selective-search".parse::<ProposalSource>().unwrap(),
            ProposalSource::SelectiveSearch
        );
        assert_eq!("rpn".parse::<ProposalSource>().unwrap(), ProposalSource::Rpn);
    }

    #[test]
    fn test_variant_suffixes() {
        assert_eq!(Variant::from_flags(false, false).suffix(), "");
        assert_eq!(Variant::from_flags(true, false).suffix(), "_gc");
        assert_eq!(Variant::from_flags(false, true).suffix(), "_align");
        assert_eq!(Variant::from_flags(true, true).suffix(), "_gc_align");
    }

    #[test]
    fn test_config_defaults() {
        let config = TestConfig::new();
        assert_eq!(config.scales, vec![(600, 1000)]);
        assert_eq!(config.roi_margin, 30);
        assert!(config.font_path.is_none());
    }

    #[test]
    fn test_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.json");
        let path = path.to_str().unwrap();

        let config = TestConfig::new().with_roi_margin(12);
        config.save(path).unwrap();

        let loaded = TestConfig::load_or_default(path).unwrap();
        assert_eq!(loaded.roi_margin, 12);
        assert_eq!(loaded.scales, config.scales);

        let missing = dir.path().join("absent.json");
        let fallback = TestConfig::load_or_default(missing.to_str().unwrap()).unwrap();
        assert_eq!(fallback.roi_margin, 30);
    }
}
