//! burn-diffusion CLI
//!
//! Checkpoint tooling for guided latent diffusion:
//! - `inspect`: list tensors and metadata, and guess what a checkpoint holds
//! - `lora`: dry-run a LoRA against a UNet and/or text encoder
//! - `upscale`: run a super-resolution model over images

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use burn_diffusion::backends::{default_device, DefaultBackend};
use burn_diffusion::convert::SafeTensorFile;
use burn_diffusion::{
    load_lora, load_text_encoder, load_unet, load_upscaler, upscale_super_resolution,
    CheckpointKind, PrecisionMode,
};

#[derive(Parser)]
#[command(name = "burn-diffusion")]
#[command(about = "Guided latent diffusion checkpoint tools in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print tensor names, shapes, dtypes and metadata of a checkpoint
    Inspect {
        /// Path to a .safetensors file
        path: PathBuf,

        /// Filter tensor names (substring match)
        #[arg(short, long)]
        filter: Option<String>,

        /// Only print the summary, not every tensor
        #[arg(long)]
        summary: bool,
    },

    /// Attach a LoRA to networks and report which adapters matched
    Lora {
        /// LoRA checkpoint
        lora: PathBuf,

        /// UNet checkpoint (needs model_type and prediction_type metadata)
        #[arg(long)]
        unet: Option<PathBuf>,

        /// Text encoder checkpoint (needs model_type metadata)
        #[arg(long)]
        clip: Option<PathBuf>,

        /// Override the checkpoint precision (fp32, fp16, bf16)
        #[arg(long, value_parser = PrecisionMode::parse)]
        precision: Option<PrecisionMode>,
    },

    /// Upscale images with an RRDBNet (ESRGAN) model
    Upscale {
        /// Super-resolution model checkpoint
        model: PathBuf,

        /// Input images
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Scale factor relative to the input size
        #[arg(long, default_value = "4.0")]
        factor: f64,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Override the checkpoint precision (fp32, fp16, bf16)
        #[arg(long, value_parser = PrecisionMode::parse)]
        precision: Option<PrecisionMode>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            path,
            filter,
            summary,
        } => run_inspect(&path, filter.as_deref(), summary),
        Commands::Lora {
            lora,
            unet,
            clip,
            precision,
        } => run_lora(&lora, unet.as_deref(), clip.as_deref(), precision),
        Commands::Upscale {
            model,
            images,
            factor,
            output,
            precision,
        } => run_upscale(&model, &images, factor, &output, precision),
    }
}

fn run_inspect(path: &Path, filter: Option<&str>, summary: bool) -> Result<()> {
    let file = SafeTensorFile::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let weights = file.to_weights().context("Failed to read tensors")?;

    println!("File:    {}", path.display());
    println!("Tensors: {}", file.len());
    println!("Kind:    {}", CheckpointKind::detect(&weights));

    if let Some(metadata) = file.metadata() {
        let mut entries = metadata.iter().collect::<Vec<_>>();
        entries.sort();
        println!("\nMetadata:");
        for (key, value) in entries {
            println!("  {key}: {value}");
        }
    }

    if summary {
        return Ok(());
    }

    println!();
    let mut names = file.names().collect::<Vec<_>>();
    names.sort_unstable();
    for name in names {
        if filter.is_some_and(|filter| !name.contains(filter)) {
            continue;
        }
        let shape = file.shape(name).unwrap_or_default();
        match file.dtype(name) {
            Some(dtype) => println!("{name}: {shape:?} ({dtype:?})"),
            None => println!("{name}: {shape:?}"),
        }
    }

    Ok(())
}

fn run_lora(
    lora: &Path,
    unet: Option<&Path>,
    clip: Option<&Path>,
    precision: Option<PrecisionMode>,
) -> Result<()> {
    if unet.is_none() && clip.is_none() {
        bail!("Pass at least one of --unet or --clip to attach the LoRA to");
    }

    let device = default_device();
    let lora_set = load_lora::<DefaultBackend>(lora, precision, &device)
        .with_context(|| format!("Failed to load LoRA {}", lora.display()))?;

    let unet = unet
        .map(|path| {
            load_unet::<DefaultBackend>(path, precision, &device)
                .with_context(|| format!("Failed to load UNet {}", path.display()))
        })
        .transpose()?;
    let clip = clip
        .map(|path| {
            load_text_encoder::<DefaultBackend>(path, precision, &device)
                .with_context(|| format!("Failed to load text encoder {}", path.display()))
        })
        .transpose()?;

    let mut registries = Vec::new();
    if let Some(clip) = &clip {
        registries.push(&clip.adapters);
    }
    if let Some(unet) = &unet {
        registries.push(&unet.adapters);
    }

    let report = lora_set.attach(&registries);
    println!("LoRA:     {}", lora.display());
    println!("Adapters: {}", lora_set.len());
    println!("Attached: {}", report.attached.len());
    println!("Skipped:  {}", report.skipped.len());
    for name in &report.skipped {
        println!("  {name}");
    }

    for registry in registries {
        registry.clear();
    }
    Ok(())
}

fn run_upscale(
    model: &Path,
    images: &[PathBuf],
    factor: f64,
    output: &Path,
    precision: Option<PrecisionMode>,
) -> Result<()> {
    if factor <= 0.0 {
        bail!("Scale factor must be positive, got {factor}");
    }

    let device = default_device();
    let model = load_upscaler::<DefaultBackend>(model, precision, &device)
        .with_context(|| format!("Failed to load upscaler {}", model.display()))?;
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let pb = ProgressBar::new(images.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    for path in images {
        pb.set_message(path.display().to_string());
        let input = image::open(path)
            .with_context(|| format!("Failed to read image {}", path.display()))?
            .to_rgb8();

        let upscaled = upscale_super_resolution(&[input], &model, factor);
        let target = output_path(output, path, factor);
        for image in upscaled {
            image
                .save(&target)
                .with_context(|| format!("Failed to save {}", target.display()))?;
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    println!("Upscaled {} image(s) into {}", images.len(), output.display());
    Ok(())
}

/// `{output}/{stem}_x{factor}.png`
fn output_path(output: &Path, input: &Path, factor: f64) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output.join(format!("{stem}_x{factor}.png"))
}
