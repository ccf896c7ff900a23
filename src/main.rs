//! CLI entry point for leelaz-train.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leelaz_train_rs::checkpoint;
use leelaz_train_rs::{
    ExecutionContext, LeelazNet, NetworkConfig, SyntheticBatchSource, TrainConfig, TrainingLoop,
    WeightExporter,
};

#[derive(Parser)]
#[command(name = "leelaz-train")]
#[command(about = "Train the Leela Zero network and export engine weights")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    /// 6x128 network
    LeelaZero,
    /// Tiny network for smoke runs
    Test,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "train.yaml")]
        output: PathBuf,
        /// Network preset
        #[arg(long, value_enum, default_value = "leela-zero")]
        preset: Preset,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Train on synthetic positions
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Resume from checkpoint
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Stop once this many total steps are done (overrides max_steps)
        #[arg(long)]
        steps: Option<u64>,
    },
    /// Write the weights file of a checkpoint
    Export {
        /// Path to configuration file
        config: PathBuf,
        /// Checkpoint tensor file
        #[arg(long)]
        checkpoint: PathBuf,
        /// Output weights file
        #[arg(long)]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, preset } => {
            let mut config = TrainConfig::default();
            if let Preset::Test = preset {
                config.network = NetworkConfig::test();
                config.training.batch_size = 8;
            }
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = TrainConfig::from_file(&config)?;
            config.validate()?;
            let network = &config.network;
            println!("✓ Configuration is valid");
            println!(
                "  Network: {} blocks x {} filters, {}x{} board",
                network.residual_blocks, network.channels, network.board_size, network.board_size
            );
            println!("  Weights file entries: {}", network.registry_len());
            println!("  Output: {}", config.output_dir);
        }
        Commands::Train {
            config,
            resume,
            steps,
        } => {
            tracing::info!("Starting training with config: {}", config.display());
            let config = TrainConfig::from_file(&config)?;
            let ctx = ExecutionContext::acquire(&config.device)?;
            let target = steps.or(config.training.max_steps);
            let source =
                SyntheticBatchSource::new(&config.network, config.training.batch_size, config.seed);

            let mut trainer = TrainingLoop::new(config, &ctx, source)?;
            if let Some(checkpoint) = resume {
                trainer.restore(&checkpoint)?;
            }

            match target {
                Some(total) => {
                    let summary = trainer.run(total.saturating_sub(trainer.step()))?;
                    println!(
                        "✓ Trained {} steps (now at step {})",
                        summary.steps,
                        trainer.step()
                    );
                }
                None => loop {
                    trainer.process()?;
                },
            }
        }
        Commands::Export {
            config,
            checkpoint: path,
            output,
        } => {
            let config = TrainConfig::from_file(&config)?;
            let ctx = ExecutionContext::acquire(&config.device)?;
            let net = LeelazNet::new(&config.network, &ctx, config.seed)?;
            let step = checkpoint::restore(&path, &net)?;
            WeightExporter::new(net.registry(), &net).save(&output)?;
            println!(
                "✓ Weights of step {step} written to: {}",
                output.display()
            );
        }
    }

    Ok(())
}
