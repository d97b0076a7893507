//! This crate ties in all the parts of the projects and provides a command line interface
//! to train stacked tiled auto-encoders on images.

use env_logger::Builder;
use log::info;
use ml::{
    config::StackConfig,
    convolutions::Stage,
    models::Stack,
    reconstruction::{ScoreMask, Summary},
};
use quicli::prelude::*;
use std::path::PathBuf;
use structopt::StructOpt;
use tilenet::{check_fits, load_tensor, random_position, to_grayscale};

/// Greedily trains a stack on random patches of one input
#[derive(Debug, StructOpt)]
struct TrainOpts {
    /// Path to the stack configuration (JSON)
    #[structopt(parse(from_os_str))]
    config: PathBuf,
    /// Training input: .npy array in (channels, height, width) layout, or a .png/.jpg image
    #[structopt(parse(from_os_str))]
    input: PathBuf,
    /// Overrides the number of epochs every stage is trained for
    #[structopt(short = "e", long = "epochs")]
    epochs: Option<usize>,
    /// Overrides the seed of the configuration
    #[structopt(short = "s", long = "seed")]
    seed: Option<u64>,
    /// Averages the input channels into one
    #[structopt(long = "grayscale")]
    grayscale: bool,
    /// Prints the central multi-layer features of the input after training
    #[structopt(long = "features")]
    features: bool,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Prints the topology a configuration builds
#[derive(Debug, StructOpt)]
struct InspectOpts {
    /// Path to the stack configuration (JSON)
    #[structopt(parse(from_os_str))]
    config: PathBuf,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Train and inspect stacked tiled auto-encoders.
#[derive(Debug, StructOpt)]
#[structopt(name = "TileNet")]
enum Tilenet {
    #[structopt(
        name = "train",
        about = "Trains a stack stage by stage and prints its reconstruction score."
    )]
    Train(TrainOpts),
    #[structopt(
        name = "inspect",
        about = "Prints the stages, grids and patch sizes of a configuration."
    )]
    Inspect(InspectOpts),
}

/// Trait for the subcommands that tilenet uses
trait TilenetOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

fn print_summary(name: &str, summary: Option<&Summary>) {
    if let Some(summary) = summary {
        println!(
            "{:>12}: mean {:.6}, variance {:.6}",
            name,
            summary.mean(),
            summary.variance()
        );
    }
}

fn print_topology(stack: &Stack) {
    for index in 0..stack.len() {
        let stage = stack.stage(index);
        println!(
            "stage {}: {:<12} input patch {:?} x {}, output grid {:?} x {}",
            index,
            stage.name(),
            stage.input_patch(),
            stage.input_depth(),
            stage.output_grid(),
            stage.output_depth()
        );
    }
    println!("base patch {:?}, feature length {}", stack.base_patch(), stack.feature_len());
}

impl TilenetOpts for TrainOpts {
    fn run(&self) -> CliResult {
        let mut config = StackConfig::from_path(&self.config)?;
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        let mut input = load_tensor(&self.input)?;
        if self.grayscale {
            input = to_grayscale(&input);
        }

        let mut rng = config.rng();
        let mut stack = Stack::new();
        let samples = config.training.samples_per_epoch.max(1);
        for (index, stage) in config.stages.iter().enumerate() {
            stage.add_to(&mut stack, &mut rng)?;
            let patch = stack.base_patch();
            check_fits(&input, patch, stack.input_depth())?;
            if !stack.stage(index).is_trainable() {
                info!("Stage {} ({}) has nothing to train", index, stack.stage(index).name());
                continue;
            }
            for epoch in 0..config.training.epochs {
                let mut total = 0.0;
                for _ in 0..samples {
                    let (x, y) = random_position(&mut rng, &input, patch);
                    stack.set_input(&input, x, y);
                    total += stack.train_top(&input)?;
                }
                info!(
                    "Stage {} epoch {}: mean error {}",
                    index,
                    epoch,
                    total / samples as f32
                );
            }
        }

        print_topology(&stack);
        let score = stack.reconstruction_score(&input, config.training.score_stride, ScoreMask::ALL);
        println!("reconstruction score over {} positions", score.positions());
        print_summary("euclidean", score.euclidean());
        print_summary("invariant", score.invariant());
        print_summary("correlation", score.correlation());

        if self.features {
            stack.center_input(&input, input.width() / 2, input.height() / 2);
            stack.forward(&input);
            let features: Vec<String> = stack
                .central_multilayer_features()
                .iter()
                .map(|f| format!("{:.4}", f))
                .collect();
            println!("features: {}", features.join(" "));
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl TilenetOpts for InspectOpts {
    fn run(&self) -> CliResult {
        let config = StackConfig::from_path(&self.config)?;
        let stack = config.build()?;
        print_topology(&stack);
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl TilenetOpts for Tilenet {
    fn run(&self) -> CliResult {
        match self {
            Tilenet::Train(c) => c.run(),
            Tilenet::Inspect(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            Tilenet::Train(c) => c.get_verbosity(),
            Tilenet::Inspect(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = Tilenet::from_args();
    args.setup_env_logger()?;
    args.run()
}
