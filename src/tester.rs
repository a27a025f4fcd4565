use std::path::Path;

use crate::{
    adapt::{AdaptationPlan, ParameterAdapter},
    config::{LOG_PATH, RunOptions, TestConfig, Variant},
    engine::ExecutionEngine,
    error::Result,
    eval::{EvalSettings, pred_eval},
    imdb::{Imdb, open_imdb},
    loader::{LoaderSettings, TestLoader},
    network::{NetworkBuilder, NetworkDeclaration, ShapeSpec},
    params::{CheckpointLoader, ParameterStore},
    session::{SessionRequest, build_session},
    shapes::MaxShapePolicy,
    stats::EvalStats,
    validate::{ValidationReport, validate_shapes},
    vis::Visualizer,
};

/// A bound predictor and what preparing it established.
pub struct PreparedSession<P> {
    pub predictor: P,
    pub max_shapes: Vec<ShapeSpec>,
    pub report: ValidationReport,
    pub adaptation: Option<AdaptationPlan>,
}

/// Adapts, validates and binds `store` for `network`.
///
/// The global-context adaptation runs before validation, so a missing donor
/// parameter surfaces as [`crate::Error::MissingSourceParameter`] rather than
/// a missing target. Validation uses the shapes of the first test batch; the
/// predictor is bound for the largest shapes of the whole run.
#[allow(clippy::too_many_arguments)]
pub fn prepare_session<E: ExecutionEngine>(
    engine: &E,
    network: &dyn NetworkDeclaration,
    mut store: ParameterStore,
    variant: Variant,
    config: &TestConfig,
    has_rpn: bool,
    data_names: Vec<String>,
    provide_data: Vec<ShapeSpec>,
) -> Result<PreparedSession<E::Predictor>> {
    let adaptation = ParameterAdapter::for_variant(variant)
        .map(|adapter| adapter.adapt(&mut store, network))
        .transpose()?;

    let report = validate_shapes(&store, network, &provide_data)?;

    let max_shapes = MaxShapePolicy::from_config(config, has_rpn).resolve()?;
    tracing::info!("max data shapes {:?}", max_shapes);

    let predictor = build_session(
        engine,
        SessionRequest {
            network,
            store,
            data_names,
            label_names: Vec::new(),
            max_shapes: max_shapes.clone(),
            provide_data,
            provide_label: Vec::new(),
        },
    )?;

    Ok(PreparedSession {
        predictor,
        max_shapes,
        report,
        adaptation,
    })
}

/// Tests the checkpoint `options.prefix`/`options.epoch` on the configured
/// dataset.
///
/// Returns the mean AP for ImageNet and `None` for datasets scored by
/// external tooling.
pub fn test_rcnn<E: ExecutionEngine>(
    options: &RunOptions,
    config: &TestConfig,
    engine: &E,
    checkpoint: &dyn CheckpointLoader,
) -> Result<Option<f32>> {
    tracing::info!("{:#?}", options);
    tracing::info!("{:#?}", config);

    let builder = NetworkBuilder::new(&options.network, options.has_rpn, options.variant)?;
    let network = builder.load(&options.symbol_dir)?;
    tracing::info!("network {}", builder.entry_point());

    let imdb = open_imdb(
        options.dataset,
        &options.image_set,
        &options.root_path,
        &options.dataset_path,
    )?;

    evaluate_network(
        options,
        config,
        engine,
        checkpoint,
        &network,
        imdb.as_ref(),
        Path::new(LOG_PATH),
    )
}

/// Everything after network and dataset selection.
pub fn evaluate_network<E: ExecutionEngine>(
    options: &RunOptions,
    config: &TestConfig,
    engine: &E,
    checkpoint: &dyn CheckpointLoader,
    network: &dyn NetworkDeclaration,
    imdb: &dyn Imdb,
    log_path: &Path,
) -> Result<Option<f32>> {
    if imdb.num_classes() != config.num_classes {
        tracing::warn!(
            "{} has {} classes, config expects {}",
            imdb.name(),
            imdb.num_classes(),
            config.num_classes
        );
    }

    let gt_roidb = imdb.gt_roidb()?;
    let roidb = if options.has_rpn {
        gt_roidb
    } else {
        imdb.proposal_roidb(options.proposal, gt_roidb)?
    };

    let mut loader = TestLoader::new(
        roidb,
        1,
        options.shuffle,
        options.has_rpn,
        LoaderSettings::from(config),
    )?;

    let store = checkpoint.load(&options.prefix, options.epoch)?;

    let mut session = prepare_session(
        engine,
        network,
        store,
        options.variant,
        config,
        options.has_rpn,
        loader.data_names(),
        loader.provide_data().to_vec(),
    )?;

    let visualizer = if options.vis {
        Some(Visualizer::new(&options.root_path, config)?)
    } else {
        None
    };
    let mut stats = EvalStats::new(log_path, loader.num_images(), imdb.name())?;

    let result = pred_eval(
        &mut session.predictor,
        &mut loader,
        imdb,
        &EvalSettings::new(options, config),
        visualizer.as_ref(),
        &mut stats,
    )?;

    let summary = result.summary_for(options.dataset)?;
    if let Some(map) = summary {
        tracing::info!("{} mean AP {:.4}", options.dataset, map);
    }
    for (range, value) in result.size_breakdown.iter() {
        tracing::info!("{range}: {value}");
    }

    Ok(summary)
}
