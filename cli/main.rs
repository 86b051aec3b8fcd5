#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use vigil::config::PipelineConfig;
use vigil::learn::model::ModelKind;
use vigil::pipeline;

#[derive(Clone, Copy, ValueEnum)]
pub enum ModelCli {
    /// Penalized logistic regression
    Lr,
    /// Random forest
    Rf,
}

impl From<ModelCli> for ModelKind {
    fn from(model: ModelCli) -> Self {
        match model {
            ModelCli::Lr => ModelKind::LogisticRegression,
            ModelCli::Rf => ModelKind::RandomForest,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the TOML run configuration
    #[arg(long, value_name = "FILE")]
    pub config: String,

    /// Directory for written artifacts (overrides `output_dir`)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<String>,

    /// Seed for patient splitting and rebalancing (overrides `seed`)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Classifier family (overrides `model`)
    #[arg(long, value_enum)]
    pub model: Option<ModelCli>,
}

impl RunArgs {
    fn load(&self) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
        let mut config = PipelineConfig::load(&self.config)?;
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(model) = self.model {
            config.model = model.into();
        }
        Ok(config)
    }
}

#[derive(Args)]
pub struct InferArgs {
    /// Feature table (TSV) with the columns the model was trained on; ID and LABEL are optional
    pub features: PathBuf,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "vigil",
    about = "Outcome prediction from longitudinal clinical measurements",
    long_about = "Samples labeled feature windows from per-patient measurement series under a \
                 prediction-gap policy, then trains, evaluates and explains a classifier."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline: sample, train, evaluate and explain
    Run(RunArgs),
    /// Sample labeled windows and write the train/val/test feature tables
    Sample(RunArgs),
    /// Score a feature table with a saved model
    Infer(InferArgs),
    #[command(about = "Display version information")]
    Version,
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.load()?;
    let report = pipeline::run(&config)?;
    println!(
        "Validation AUC: {:.4} (test AUC {:.4}, {})",
        report.validation_auc, report.test_auc, report.params
    );
    println!("Artifacts written to '{}'", config.output_dir);
    Ok(())
}

fn sample(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.load()?;
    let prepared = pipeline::sample(&config)?;
    println!(
        "Sampled {} train, {} val and {} test windows into '{}'",
        prepared.train.len(),
        prepared.val.len(),
        prepared.test.len(),
        config.output_dir
    );
    Ok(())
}

fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    let probabilities = pipeline::infer(&args.features, &args.model, &args.output)?;
    println!(
        "Scored {} windows; predictions saved to '{}'",
        probabilities.len(),
        args.output.display()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Sample(args)) => sample(args),
        Some(Commands::Infer(args)) => infer(args),
        Some(Commands::Version) => {
            println!("vigil {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
