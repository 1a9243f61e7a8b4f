use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use pivotune::config::TrainingConfig;
use pivotune::device::select_device;
use pivotune::logging;

#[derive(Parser, Debug)]
#[command(name = "trainer")]
#[command(about = "Pivotal-tuning trainer: validate a config and print the training plan")]
struct Args {
    /// Path to the training config (YAML or JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the output directory from the config
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    logging::init_logger();
    let args = Args::parse();

    let mut config = match args.config.extension().and_then(|e| e.to_str()) {
        Some("json") => TrainingConfig::from_json(&args.config)?,
        _ => TrainingConfig::from_yaml(&args.config)?,
    };
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }

    config
        .validate()
        .context("configuration rejected")?;
    config.apply_variant_overrides();

    let device = select_device(config.device_ordinal)?;
    info!("Device: {:?}", device);
    info!("Output dir: {}", config.output_dir.display());
    info!(
        "UNet group: {} (lr {}, rank {}, weight decay {})",
        config.unet_optimizer, config.unet_lr, config.lora_rank, config.lora_weight_decay
    );
    info!(
        "Textual-inversion group: {} (lr {}, tokens {:?}, pivot {})",
        config.ti_optimizer,
        config.ti_lr,
        config.inserting_tokens(),
        if config.hard_pivot {
            format!("hard at {:.0}%", config.pivot_completion_f * 100.0)
        } else {
            "soft (quadratic decay)".to_string()
        }
    );
    match &config.text_encoder_lora_optimizer {
        Some(kind) => info!(
            "Text-encoder group: {} (lr {}, rank {})",
            kind, config.text_encoder_lora_lr, config.text_encoder_lora_rank
        ),
        None => info!("Text-encoder group: disabled"),
    }
    info!(
        "Schedule: {} epochs / {:?} max steps, accumulate {}, checkpoint every {}",
        config.num_train_epochs,
        config.max_train_steps,
        config.gradient_accumulation_steps,
        config.checkpointing_steps
    );
    info!(
        "Loss: prediction {}, snr_gamma {:?}, l1_penalty {}, noise_offset {}",
        config.prediction_type, config.snr_gamma, config.l1_penalty, config.noise_offset
    );
    info!("Config OK");
    Ok(())
}
