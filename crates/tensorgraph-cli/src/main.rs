//! TensorGraph CLI - inspect model files and run the built-in networks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tensorgraph_cli::NetworkKind;
use tensorgraph_cli::inspect::{check_network, describe_model, describe_network};
use tensorgraph_cli::run::{RunOptions, channel_stats, run_frames, save_raw};
use tensorgraph_runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tensorgraph")]
#[command(about = "GPU tensor engine for small convolutional networks", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a model file's tensors
    Inspect {
        /// Path to the model file
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Also show a network's stages resolved against the model
        #[arg(short, long, value_enum)]
        network: Option<NetworkKind>,
    },
    /// Run a built-in network over a generated test image
    Run {
        /// Path to the model file
        #[arg(value_name = "MODEL")]
        model: PathBuf,

        /// Network architecture the model was trained for
        #[arg(short, long, value_enum, default_value = "denoiser")]
        network: NetworkKind,

        /// Input width in pixels
        #[arg(long, default_value = "256")]
        width: u32,

        /// Input height in pixels
        #[arg(long, default_value = "256")]
        height: u32,

        /// Number of frames to run
        #[arg(short, long, default_value = "10")]
        frames: u32,

        /// Tile edge (defaults to the network's)
        #[arg(long)]
        tile: Option<u32>,

        /// Upload the weights as binary16
        #[arg(long)]
        f16: bool,

        /// Write the last presented frame as raw RGBA8 bytes
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Inspect { model, network } => cmd_inspect(model, network)?,
        Commands::Run {
            model,
            network,
            width,
            height,
            frames,
            tile,
            f16,
            output,
        } => {
            let options = RunOptions {
                network,
                width,
                height,
                frames,
                tile,
                f16,
            };
            cmd_run(model, &options, output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> Result<tensorgraph_model::Model> {
    tensorgraph_model::load_model(path)
        .with_context(|| format!("Failed to load model from {}", path.display()))
}

fn cmd_inspect(model_path: PathBuf, network: Option<NetworkKind>) -> Result<()> {
    let model = load(&model_path)?;
    print!("{}", describe_model(&model)?);

    if let Some(kind) = network {
        let network = kind.network();
        println!();
        print!("{}", describe_network(&model, &network)?);
        check_network(&model, &network)?;
    }
    Ok(())
}

fn cmd_run(model_path: PathBuf, options: &RunOptions, output: Option<PathBuf>) -> Result<()> {
    let model = load(&model_path)?;
    check_network(&model, &options.network.network())?;

    let runtime = pollster::block_on(Runtime::new()).context("Failed to initialize GPU")?;
    let adapter = runtime.adapter_info();
    eprintln!("Using {} ({:?})", adapter.name, adapter.backend);

    let stats = run_frames(&runtime, &model, options)?;
    println!(
        "{} frames, {} dispatches/frame, mean {:.3} ms, slowest {:.3} ms, scratch {} bytes x2",
        stats.frames,
        stats.dispatches,
        stats.mean().as_secs_f64() * 1000.0,
        stats.slowest.as_secs_f64() * 1000.0,
        stats.scratch_bytes
    );

    if let Some(classes) = &stats.classes {
        let listed: Vec<String> = classes.iter().map(|c| c.to_string()).collect();
        println!("Classes per tile: {}", listed.join(" "));
    }
    if let Some(image) = &stats.image {
        for (name, (mean, min, max)) in ["r", "g", "b", "a"].iter().zip(channel_stats(image)) {
            println!("  {name}: mean {mean:.4} min {min:.4} max {max:.4}");
        }
        if let Some(path) = output {
            save_raw(image, &path)?;
            eprintln!("Wrote {}x{} RGBA8 to {}", image.width, image.height, path.display());
        }
    } else if output.is_some() {
        anyhow::bail!("--output needs a network that presents an image");
    }

    Ok(())
}
