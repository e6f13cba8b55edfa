//! LoopTree CLI
//!
//! # Usage
//!
//! ## Run the model
//! ```bash
//! cargo run --bin looptree -- run conv_chain.toml
//! cargo run --bin looptree -- run conv_chain.json --json
//! ```
//!
//! ## Inspect the branch tilings
//! ```bash
//! RUST_LOG=debug cargo run --bin looptree -- tilings conv_chain.toml
//! ```

use clap::{Parser, Subcommand};
use log::info;
use looptree::parse::load_config;
use looptree::pipeline::LooptreeModel;
use looptree::tiling::{describe_tilings, tiling_from_mapping};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "looptree")]
#[clap(about = "LoopTree - affine analysis of fused loop-tree mappings")]
#[clap(version = "0.1")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lower the mapping and print ops, fills, occupancy and temporal steps
    Run {
        /// Model configuration (.json or .toml)
        #[clap(value_name = "CONFIG")]
        config: PathBuf,

        /// Print the result as JSON
        #[clap(long = "json")]
        json: bool,

        /// Enable verbose output
        #[clap(long = "verbose", short = 'v')]
        verbose: bool,
    },

    /// Print the tiling of every compute leaf before loop bound inference
    Tilings {
        /// Model configuration (.json or .toml)
        #[clap(value_name = "CONFIG")]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Commands::Run { config, json, verbose } => run_command(config, json, verbose)?,
        Commands::Tilings { config } => tilings_command(config)?,
    }

    Ok(())
}

fn run_command(config_path: PathBuf, json: bool, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&config_path)?;
    config.model.verbose |= verbose;
    let model = LooptreeModel::from_config(&config)?;
    let result = model.run()?;
    let stats = result.to_json(&model);

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", result.render(&model));
    }

    if let Some(prefix) = &config.model.out_prefix {
        let path = PathBuf::from(format!("{}.stats.json", prefix));
        std::fs::write(&path, serde_json::to_string_pretty(&stats)?)?;
        info!("Wrote {}", path.display());
    }

    Ok(())
}

fn tilings_command(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&config_path)?;
    let model = LooptreeModel::from_config(&config)?;
    let tilings = tiling_from_mapping(model.mapping(), model.workload())?;
    print!("{}", describe_tilings(&tilings, model.mapping(), model.workload())?);
    Ok(())
}
