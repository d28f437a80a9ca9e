//! Command-line interface

use crate::document::{FrozenDocument, StoreDocument};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use modfreeze_analysis::{FreezeMetrics, MetricsCollector};
use modfreeze_core::{FreezeOptions, FreezePipeline, FreezeSummary, ModuleId, Store};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "modfreeze", version, about = "Fold immutable module attributes into method graphs")]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Freeze a module tree from a store document
    Freeze(FreezeArgs),

    /// Print the module tree of a store document
    Inspect {
        /// Store document (JSON)
        input: PathBuf,

        /// Root module name, if the document does not name one
        #[arg(long)]
        root: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
pub struct FreezeArgs {
    /// Store document (JSON)
    pub input: PathBuf,

    /// Root module name, if the document does not name one
    #[arg(long)]
    pub root: Option<String>,

    /// Root attribute to keep live (repeatable)
    #[arg(long = "preserve-attr", value_name = "NAME")]
    pub preserve_attrs: Vec<String>,

    /// Root method to keep callable (repeatable)
    #[arg(long = "preserve-method", value_name = "NAME")]
    pub preserve_methods: Vec<String>,

    /// Entry method (default: forward)
    #[arg(long)]
    pub entry: Option<String>,

    /// Skip constant simplification
    #[arg(long)]
    pub no_simplify: bool,

    /// Freeze options file (JSON); flags take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the frozen store document here
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the summary and metrics as JSON instead of text
    #[arg(long)]
    pub report: bool,
}

/// Installs the fmt subscriber on stderr. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "modfreeze=debug,modfreeze_core=debug" } else { "modfreeze=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Freeze(args) => {
            let frozen = freeze_command(&args)?;
            if args.report {
                let report = serde_json::json!({
                    "summary": frozen.summary,
                    "metrics": frozen.metrics,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_summary(&frozen.summary, &frozen.metrics));
            }
            Ok(())
        }
        Commands::Inspect { input, root } => {
            let doc = StoreDocument::load(&input)?;
            let root = doc.root_id(root.as_deref())?;
            print!("{}", render_tree(&doc.store, root)?);
            Ok(())
        }
    }
}

/// Options file (or defaults) with command-line flags applied on top.
pub fn build_options(args: &FreezeArgs) -> Result<FreezeOptions> {
    let mut options = match &args.config {
        Some(path) => FreezeOptions::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => FreezeOptions::default(),
    };
    if let Some(entry) = &args.entry {
        options = options.with_entry(entry);
    }
    options = options
        .with_preserved_attrs(args.preserve_attrs.iter().cloned())
        .with_preserved_methods(args.preserve_methods.iter().cloned());
    if args.no_simplify {
        options = options.without_simplify();
    }
    Ok(options)
}

/// Loads, freezes and optionally writes the frozen document.
pub fn freeze_command(args: &FreezeArgs) -> Result<FrozenDocument> {
    let options = build_options(args)?;
    debug!(?options, "freeze options");
    let mut doc = StoreDocument::load(&args.input)?;
    let root = doc.root_id(args.root.as_deref())?;

    let frozen = FreezePipeline::new()
        .freeze(&mut doc.store, root, &options)
        .with_context(|| format!("freezing '{}'", doc.store.path_of(root)))?;
    let metrics = MetricsCollector::new().collect(&doc.store, root, &frozen)?;

    let out = FrozenDocument {
        root: frozen.root(),
        summary: frozen.summary().clone(),
        metrics,
        store: doc.store,
    };
    if let Some(path) = &args.output {
        out.save(path)?;
        info!("Wrote frozen module to {}", path.display());
    }
    Ok(out)
}

pub fn render_summary(summary: &FreezeSummary, metrics: &FreezeMetrics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", "Frozen module".bold().green());
    let _ = writeln!(
        out,
        "  {} {} -> {}",
        "slots:".bold(),
        metrics.before.slots,
        metrics.after.slots
    );
    let _ = writeln!(
        out,
        "  {} {} -> {}",
        "instructions:".bold(),
        metrics.before.instructions,
        metrics.after.instructions
    );
    let _ = writeln!(
        out,
        "  {} {} created, {} specialized",
        "classes:".bold(),
        summary.classes_created,
        summary.classes_specialized
    );
    for path in &summary.folded {
        let _ = writeln!(out, "  {} {path}", "folded".cyan());
    }
    for attr in &summary.preserved {
        let _ = writeln!(out, "  {} {} ({})", "preserved".yellow(), attr.path, attr.reason);
    }
    for method in &summary.dropped_methods {
        let _ = writeln!(out, "  {} {method}", "dropped".red());
    }
    out
}

/// Indented tree: one line per module, one per attribute slot.
pub fn render_tree(store: &Store, root: ModuleId) -> Result<String> {
    let mut out = String::new();
    render_module(store, root, 0, &mut Vec::new(), &mut out)?;
    Ok(out)
}

fn render_module(store: &Store, id: ModuleId, depth: usize, seen: &mut Vec<ModuleId>, out: &mut String) -> Result<()> {
    let module = store.module(id)?;
    let class = store.class(module.class)?;
    let indent = "  ".repeat(depth);
    let mode = if module.training { "training" } else { "eval" };
    let _ = writeln!(out, "{indent}{} ({}, {mode})", module.name.bold(), class.name);
    seen.push(id);
    for (name, slot) in &module.slots {
        match slot.value.as_module() {
            Some(child) if seen.contains(&child) => {
                let _ = writeln!(out, "{indent}  {name}: -> {}", store.path_of(child));
            }
            Some(child) => {
                let _ = writeln!(out, "{indent}  {name}:");
                render_module(store, child, depth + 2, seen, out)?;
            }
            None => {
                let _ = writeln!(out, "{indent}  {name}: {} = {}", slot.ty, store.heap.render(&slot.value));
            }
        }
    }
    let methods: Vec<&str> = class.methods.keys().map(String::as_str).collect();
    if !methods.is_empty() {
        let _ = writeln!(out, "{indent}  methods: {}", methods.join(", "));
    }
    Ok(())
}
