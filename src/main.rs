use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fs_err as fs;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use package_saver::file_writer::wait_for_async_file_writes;
use package_saver::logging::Log;
use package_saver::object_graph::MemoryGraph;
use package_saver::package_file::{FEngineVersion, PackageFile};
use package_saver::save::{DefaultHooks, SaveOptions, SavePackageResult, SaveTarget, save_package};

#[derive(Parser, Debug)]
struct ActionSave {
    /// Object graph as JSON
    #[arg(index = 1)]
    graph: PathBuf,
    /// Name of the package object to save, e.g. /Game/Meshes/Cube
    #[arg(index = 2)]
    package: String,
    /// Output package file
    #[arg(index = 3)]
    output: PathBuf,
    /// Path name of an object saved along with the top level objects
    #[arg(long)]
    base: Option<String>,
    #[arg(short, long, value_enum, default_value_t = SaveTarget::Editor)]
    target: SaveTarget,
    /// Previously saved package whose table order is kept
    #[arg(long)]
    conform: Option<PathBuf>,
    #[arg(long)]
    filter_editor_only: bool,
    #[arg(long)]
    seek_free: bool,
    #[arg(long)]
    full_name_sort: bool,
    #[arg(long)]
    no_preload_dependencies: bool,
    /// Write the file on a background thread
    #[arg(long = "async")]
    save_async: bool,
    #[arg(long)]
    keep_guid: bool,
    #[arg(long, default_value_t = 0)]
    schema_hash: u32,
    /// Engine version stamped into the summary, e.g. 4.27.2
    #[arg(long)]
    engine_version: Option<String>,
}

#[derive(Parser, Debug)]
struct ActionDump {
    #[arg(index = 1)]
    package: PathBuf,
}

#[derive(Parser, Debug)]
enum Action {
    /// Save a package from an object graph
    Save(ActionSave),
    /// Print a saved package as JSON
    Dump(ActionDump),
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long)]
    debug: bool,
    #[command(subcommand)]
    action: Action,
}

fn setup_logging(args: &Args) {
    let level = if args.debug {
        tracing::Level::DEBUG
    } else if args.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_ansi(false)
        .with_level(true)
        .with_target(true)
        .without_time()
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level));
    tracing_subscriber::registry().with(layer).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args);

    let log = Log::new(args.verbose, args.debug);
    match args.action {
        Action::Save(action) => action_save(action, &log),
        Action::Dump(action) => action_dump(action),
    }
}

fn parse_engine_version(version: &str) -> Result<FEngineVersion> {
    let mut parts = version.split('.').map(|p| p.parse::<u16>().with_context(|| format!("bad engine version {version:?}")));
    let mut next = || parts.next().transpose().map(Option::unwrap_or_default);
    Ok(FEngineVersion { major: next()?, minor: next()?, patch: next()?, ..Default::default() })
}

fn action_save(args: ActionSave, log: &Log) -> Result<()> {
    let graph = MemoryGraph::from_json(&fs::read_to_string(&args.graph)?)
        .with_context(|| format!("loading {}", args.graph.display()))?;
    let Some(package) = graph.find(&args.package) else {
        bail!("package {} not found in {}", args.package, args.graph.display());
    };
    let base = match &args.base {
        Some(path) => Some(graph.find(path).with_context(|| format!("base object {path} not found"))?),
        None => None,
    };
    let conform = match &args.conform {
        Some(path) => Some(PackageFile::open(path).with_context(|| format!("loading conform package {}", path.display()))?),
        None => None,
    };
    let options = SaveOptions {
        target: args.target,
        filter_editor_only: args.filter_editor_only,
        use_seek_free_sort: args.seek_free,
        use_full_name_sort: args.full_name_sort,
        write_preload_dependencies: !args.no_preload_dependencies,
        save_async: args.save_async,
        keep_guid: args.keep_guid,
        conform,
        schema_hash: args.schema_hash,
        engine_version: match &args.engine_version {
            Some(version) => parse_engine_version(version)?,
            None => FEngineVersion::default(),
        },
        ..Default::default()
    };

    let progress = indicatif::ProgressBar::new_spinner().with_message(format!("saving {}", args.package));
    log.set_progress(Some(&progress));
    let outcome = save_package(&graph, package, base, &args.output, &options, &DefaultHooks, log);
    if let Ok(outcome) = &outcome
        && outcome.async_write.is_some()
    {
        progress.set_message("waiting for file writes");
        wait_for_async_file_writes();
    }
    progress.finish_and_clear();
    log.set_progress(None);

    let mut outcome = outcome?;
    if let Some(handle) = outcome.async_write.take() {
        handle.join().map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
    }
    match outcome.result {
        SavePackageResult::Success => {
            log.log(&format!("wrote {} ({} bytes)", args.output.display(), outcome.package_size));
            Ok(())
        }
        // the reasons were already logged by the save
        result => bail!("saving {} failed: {result}", args.package),
    }
}

fn action_dump(args: ActionDump) -> Result<()> {
    let package = PackageFile::open(&args.package)?;
    println!("{}", serde_json::to_string_pretty(&package)?);
    Ok(())
}
