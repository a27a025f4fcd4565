use anyhow::Context;
use rcnn_eval::{
    config::{RunOptions, TestCmd, TestConfig},
    engine::{BurnEngine, GraphRegistry},
    params::JsonCheckpointLoader,
    tester,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli_cmd: TestCmd = argh::from_env();
    let options = RunOptions::try_from(&cli_cmd)?;
    let config = TestConfig::load_or_default(&cli_cmd.config)
        .with_context(|| format!("loading {}", cli_cmd.config))?;
    let checkpoint = JsonCheckpointLoader::default();

    // Graphs are linked in by the crates that implement them; none ship here.
    #[cfg(feature = "libtorch")]
    let summary = {
        use burn::backend::libtorch::{LibTorch, LibTorchDevice};

        let engine = BurnEngine::<LibTorch>::new(LibTorchDevice::Cuda(options.gpu), GraphRegistry::new());
        tester::test_rcnn(&options, &config, &engine, &checkpoint)
    };

    #[cfg(not(feature = "libtorch"))]
    let summary = {
        use burn::backend::{NdArray, ndarray::NdArrayDevice};

        if options.gpu != 0 {
            tracing::warn!("built without libtorch, ignoring --gpu {}", options.gpu);
        }
        let engine = BurnEngine::<NdArray<f32>>::new(NdArrayDevice::default(), GraphRegistry::new());
        tester::test_rcnn(&options, &config, &engine, &checkpoint)
    };

    let summary = summary.with_context(|| {
        format!(
            "testing {} epoch {} on {} {}",
            options.prefix, options.epoch, options.dataset, options.image_set
        )
    })?;

    match summary {
        Some(map) => println!("mean AP: {map:.4}"),
        None => println!("detections written for external scoring"),
    }

    Ok(())
}
