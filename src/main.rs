//! detexport CLI
//!
//! Command-line interface for exporting detection checkpoints to ONNX and
//! inspecting or re-simplifying ONNX artifacts.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use detexport::config::{CliOverrides, ExportConfig};
use detexport::graph::GraphOptimizer;
use detexport::{inspect_onnx, ExportFormat, Exporter, OnnxSerializer, ShapeBinder};
use std::path::PathBuf;
use std::process;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// detexport - export detection models to self-contained ONNX graphs
#[derive(Parser, Debug)]
#[command(name = "detexport")]
#[command(version)]
#[command(about = "Export detection checkpoints to ONNX with optional embedded NMS", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all log output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export a checkpoint to ONNX
    ///
    /// Stages: trace → bind shapes → embed NMS → simplify → serialize.
    Export(ExportArgs),

    /// Print the header, inputs, outputs, operators and metadata of an ONNX file
    Info(InfoArgs),

    /// Import an ONNX file, simplify it and write it back
    Simplify(SimplifyArgs),
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Path to the .safetensors checkpoint (can be set in config file)
    model: Option<PathBuf>,

    /// Input size: one value for square, or HEIGHT WIDTH
    #[arg(long, num_args = 1..=2, value_name = "SIZE")]
    imgsz: Vec<usize>,

    /// Artifact format (onnx)
    #[arg(long)]
    format: Option<String>,

    /// Embed non-maximum suppression in the graph
    #[arg(long)]
    nms: bool,

    /// Do not embed NMS, even if the config file enables it
    #[arg(long = "no-nms", conflicts_with = "nms")]
    no_nms: bool,

    /// Keep batch, height and width symbolic
    #[arg(long)]
    dynamic: bool,

    /// Export static shapes, even if the config file enables dynamic axes
    #[arg(long = "no-dynamic", conflicts_with = "dynamic")]
    no_dynamic: bool,

    /// Simplify the graph before writing
    #[arg(long)]
    simplify: bool,

    /// Skip simplification, even if the config file enables it
    #[arg(long = "no-simplify", conflicts_with = "simplify")]
    no_simplify: bool,

    /// Batch size for static export
    #[arg(long)]
    batch: Option<usize>,

    /// NMS IoU threshold
    #[arg(long)]
    iou: Option<f32>,

    /// NMS score threshold
    #[arg(long)]
    conf: Option<f32>,

    /// Maximum detections kept by NMS
    #[arg(long = "max-det")]
    max_det: Option<usize>,

    /// Output path (default: <model stem>.onnx beside the checkpoint)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to config file (TOML format)
    ///
    /// If not specified, searches for config in:
    /// 1. ./detexport.toml
    /// 2. ./.detexport.toml
    /// 3. ~/.config/detexport/config.toml
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Path to an ONNX file
    artifact: PathBuf,
}

#[derive(Args, Debug)]
struct SimplifyArgs {
    /// Path to an ONNX file
    input: PathBuf,

    /// Output path (default: overwrite input)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    if !cli.quiet {
        init_logging(cli.verbose);
    }

    let result = match cli.command {
        Commands::Export(args) => run_export(args),
        Commands::Info(args) => run_info(args),
        Commands::Simplify(args) => run_simplify(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Format bytes as human-readable string
fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

fn run_export(args: ExportArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ExportConfig::load(path).context("Failed to load config file")?
        }
        None => ExportConfig::find_and_load()
            .context("Failed to load config file")?
            .unwrap_or_default(),
    };

    let imgsz = match args.imgsz.as_slice() {
        [] => None,
        [size] => Some((*size, *size)),
        [height, width, ..] => Some((*height, *width)),
    };
    // --flag / --no-flag pairs; neither leaves the config value in place
    let toggle = |on: bool, off: bool| match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };

    let model = args
        .model
        .clone()
        .or_else(|| config.model.clone())
        .context("No model given (pass MODEL or set `model` in the config file)")?;

    let format = args
        .format
        .as_deref()
        .map(str::parse::<ExportFormat>)
        .transpose()
        .context("Invalid --format")?;

    let options = config.merge_with_cli(CliOverrides {
        format,
        imgsz,
        batch: args.batch,
        nms: toggle(args.nms, args.no_nms),
        dynamic: toggle(args.dynamic, args.no_dynamic),
        simplify: toggle(args.simplify, args.no_simplify),
        iou: args.iou,
        conf: args.conf,
        max_det: args.max_det,
        output: args.output,
    });

    let report = Exporter::new(options)
        .export(&model)
        .with_context(|| format!("Failed to export {}", model.display()))?;
    println!("{}", report);
    Ok(())
}

fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let summary = inspect_onnx(&args.artifact).with_context(|| format!("Failed to read {}", args.artifact.display()))?;
    let graph = &summary.graph;

    println!("{}", args.artifact.display());
    println!("  size:      {}", human_bytes(summary.file_bytes as u64));
    println!("  producer:  {}", summary.producer);
    println!("  ir:        {}", summary.ir_version);
    println!("  opset:     {}", summary.opset);
    println!("  nodes:     {}", graph.node_count());
    println!("  weights:   {}", graph.initializers().len());

    let describe = |name: &str| {
        let info = graph.tensor(name);
        let dtype = info
            .and_then(|i| i.dtype)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "?".to_string());
        let shape = info
            .and_then(|i| i.shape.as_ref())
            .map(|s| graph.symbols.render_shape(s))
            .unwrap_or_else(|| "?".to_string());
        format!("{} {}", dtype, shape)
    };

    println!("Inputs:");
    for name in graph.inputs() {
        println!("  {:<12} {}", name, describe(name));
    }
    println!("Outputs:");
    for name in graph.outputs() {
        println!("  {:<12} {}", name, describe(name));
    }
    println!("Operators:");
    for (op, count) in graph.op_histogram() {
        println!("  {:<20} {}", op, count);
    }
    if !graph.metadata.is_empty() {
        println!("Metadata:");
        for (key, value) in &graph.metadata {
            println!("  {:<12} {}", key, value);
        }
    }
    Ok(())
}

fn run_simplify(args: SimplifyArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let summary = inspect_onnx(&args.input).with_context(|| format!("Failed to read {}", args.input.display()))?;
    let mut graph = summary.graph;

    ShapeBinder::new(true)
        .propagate(&mut graph)
        .context("Failed to infer shapes")?;
    let stats = GraphOptimizer::new()
        .optimize(&mut graph)
        .context("Failed to simplify graph")?;

    let static_shapes = graph
        .inputs()
        .iter()
        .all(|name| graph.concrete_shape(name).is_some());
    let output = args.output.unwrap_or_else(|| args.input.clone());
    let written = OnnxSerializer::new()
        .with_static_shapes(static_shapes)
        .serialize(&graph, &output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Simplified {} -> {} nodes ({} iterations), wrote {} ({}) in {:.1?}",
        stats.original_nodes,
        stats.optimized_nodes,
        stats.iterations,
        output.display(),
        human_bytes(written.total_bytes),
        start.elapsed()
    );
    Ok(())
}
