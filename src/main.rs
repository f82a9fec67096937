//! vmafbridge CLI
//!
//! Command-line front end: scores a distorted Y4M clip against a reference.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use vmafbridge::{
    filter::Score, CoreInfo, FeatureRequest, ModelRequest, OutputFormat, ToolEngine, VmafConfig,
    VmafFilter, Y4mSource,
};

#[derive(Parser)]
#[command(name = "vmafbridge")]
#[command(about = "VMAF scoring for frame-pair pipelines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether the vmaf tool is available
    Info,

    /// Score a distorted clip against a reference clip
    Score {
        /// Reference clip (.y4m)
        #[arg(short, long)]
        reference: PathBuf,

        /// Distorted clip (.y4m)
        #[arg(short, long)]
        distorted: PathBuf,

        /// Report destination
        #[arg(short, long)]
        log_path: Option<PathBuf>,

        /// Report format (0=XML, 1=JSON, 2=CSV, 3=subtitle)
        #[arg(short = 'f', long)]
        log_format: Option<i64>,

        /// Model index, repeatable (0=vmaf, 1=neg, 2=b, 3=4k)
        #[arg(short, long)]
        model: Vec<i64>,

        /// Feature index, repeatable (0=psnr, 1=psnr_hvs, 2=float_ssim, 3=float_ms_ssim, 4=ciede)
        #[arg(short = 'F', long)]
        feature: Vec<i64>,

        /// Engine threads (default: all cores)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Frame requests in flight
        #[arg(short, long, default_value = "8")]
        jobs: usize,

        /// TOML configuration file; command-line options override it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List models and features
    Models,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vmafbridge=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Score {
            reference,
            distorted,
            log_path,
            log_format,
            model,
            feature,
            threads,
            jobs,
            config,
        } => {
            let mut cfg = match config {
                Some(path) => VmafConfig::from_toml_file(path)?,
                None => VmafConfig::default(),
            };
            if let Some(path) = log_path {
                cfg.log_path = path;
            }
            if let Some(code) = log_format {
                cfg.log_format = code;
            }
            if !model.is_empty() {
                cfg.models = model;
            }
            if !feature.is_empty() {
                cfg.features = feature;
            }
            if threads.is_some() {
                cfg.threads = threads;
            }
            cmd_score(reference, distorted, cfg, jobs).await
        }
        Commands::Models => cmd_models(),
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("vmafbridge {}", vmafbridge::VERSION);
    println!("==============\n");
    println!(
        "vmaf tool: {}",
        if vmafbridge::is_vmaf_available() {
            "Yes"
        } else {
            "No (install libvmaf's vmaf or set VMAF_BIN)"
        }
    );
    println!("Threads: {}", CoreInfo::detect().num_threads);
    Ok(())
}

async fn cmd_score(
    reference: PathBuf,
    distorted: PathBuf,
    config: VmafConfig,
    jobs: usize,
) -> anyhow::Result<()> {
    let reference = Arc::new(Y4mSource::open(&reference)?);
    let distorted = Arc::new(Y4mSource::open(&distorted)?);

    let filter = Arc::new(VmafFilter::create(
        CoreInfo::detect(),
        reference,
        distorted,
        &config,
        ToolEngine::init,
    )?);

    println!("Configuration:");
    println!("  Clip: {}", filter.info());
    println!("  Native format: {}", filter.pixel_format());
    println!("  Chroma: {}", if filter.chroma() { "Yes" } else { "No" });
    println!("  Report: {}", config.log_path.display());
    println!();

    let start = std::time::Instant::now();
    let processed = filter.process_all(jobs).await;
    let elapsed = start.elapsed();
    let report = filter.finish();

    println!("Results:");
    println!("  Frames scored: {}", report.frames_submitted);
    println!(
        "  Speed: {:.1} fps",
        report.frames_submitted as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    for pooled in &report.scores {
        match pooled.score {
            Score::Standalone(v) => println!("  {}: {:.6}", pooled.model.name(), v),
            Score::Collection(c) => println!(
                "  {}: {:.6} (95% CI {:.6}..{:.6})",
                pooled.model.name(),
                c.bagging,
                c.ci_p95_lo,
                c.ci_p95_hi
            ),
        }
    }
    for failure in &report.failures {
        eprintln!("  warning: {}", failure);
    }

    processed?;
    Ok(())
}

fn cmd_models() -> anyhow::Result<()> {
    println!("Models");
    println!("======\n");
    for (i, model) in ModelRequest::ALL.iter().enumerate() {
        println!("  {}  {:<10} {}", i, model.name(), model.version());
    }

    println!("\nFeatures");
    println!("========\n");
    for (i, feature) in FeatureRequest::ALL.iter().enumerate() {
        println!(
            "  {}  {:<14} {}",
            i,
            feature.name(),
            if feature.requires_chroma() {
                "(reads chroma)"
            } else {
                ""
            }
        );
    }

    println!("\nReport formats");
    println!("==============\n");
    for code in 0..4 {
        if let Some(format) = OutputFormat::from_code(code) {
            println!("  {}  {:?} (.{})", code, format, format.extension());
        }
    }

    Ok(())
}
