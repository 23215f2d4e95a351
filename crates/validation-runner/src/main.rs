use anyhow::Result;

mod config;
mod data;
mod metrics;
mod validation;

use config::RunConfig;
use data::{BatchSource, SyntheticSource};
use validation::Validator;

fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting MCDO segmentation validation");

    // 2. Load configuration: JSON file argument, otherwise environment
    let loaded = match std::env::args().nth(1) {
        Some(path) => RunConfig::from_json_file(&path),
        None => RunConfig::from_env(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    let seed = config.resolve_seed();
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Modalities: {}", config.modalities.iter().map(|m| m.name.as_str()).collect::<Vec<_>>().join(","));
    tracing::info!("  MCDO passes: {} (dropoutP {})", config.model.mcdo_passes, config.model.dropout_p);
    tracing::info!("  Layer window: {}..={}", config.model.start_layer, config.model.end_layer);
    tracing::info!(
        "  Recalibrator: {} ({} bins, {})",
        config.model.recalibrator,
        config.model.bins,
        config.model.recalibration_point
    );
    tracing::info!("  Fusion: {} / scaling: {}", config.model.fusion_module, config.model.scaling_module);
    tracing::info!("  Log directory: {}", config.logdir.display());

    // 3. Batch source and validator
    let modalities = config.modalities.iter().map(|m| m.modality()).collect();
    let source = SyntheticSource::new(&config.model, modalities, config.val_batches, seed);

    let mut validator = match Validator::new(config) {
        Ok(validator) => validator,
        Err(e) => {
            tracing::error!("Failed to initialise models: {:#}", e);
            std::process::exit(1);
        }
    };

    // 4. Validation loop
    if source.is_empty() {
        tracing::warn!("Batch source is empty, metrics will be zero");
    }
    let reports = validator.run(&source)?;
    match reports.last() {
        Some(last) => tracing::info!(
            "Finished {} validation(s); last mean IoU {:.4}, best {:.4}",
            reports.len(),
            last.scores.mean_iou,
            validator.best_iou()
        ),
        None => tracing::warn!("No validation was scheduled, check ITERATIONS and VAL_INTERVAL"),
    }

    Ok(())
}
