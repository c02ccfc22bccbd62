use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use atlasreg::app::{App, AtlasResult, InfoResult, ListResult, RegistrationResult, SearchResult};
use atlasreg::atlas::AtlasStatus;
use atlasreg::config::ConfigLoader;
use atlasreg::domain::{DataType, DatasetSpecifier, DownloadState, SourceKind};
use atlasreg::download::{DownloadAction, DownloadOptions, DownloadOutcome};
use atlasreg::error::AtlasregError;
use atlasreg::output::{ConsoleOutput, JsonOutput, OutputMode};
use atlasreg::providers::SearchQuery;
use atlasreg::worker::WorkerPool;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "atlasreg")]
#[command(about = "Fetch neuroscience datasets and register them into brain atlas space")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Path to atlasreg.json (defaults to ./atlasreg.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search upstream neuron databases")]
    Search(SearchArgs),
    #[command(about = "List known datasets and their status")]
    List(ListArgs),
    #[command(about = "Download a dataset into the local cache")]
    Download(DownloadArgs),
    #[command(about = "Show dataset info")]
    Info(SpecArgs),
    #[command(about = "Delete a dataset from the local cache")]
    Remove(SpecArgs),
    #[command(about = "Register a dataset into atlas pixel space")]
    Register(RegisterArgs),
    #[command(about = "Show local and latest version of an atlas")]
    Atlas(AtlasArgs),
}

#[derive(Args)]
struct SearchArgs {
    /// Brain structure acronym, e.g. VISp.
    #[arg(long)]
    structure: Option<String>,

    #[arg(long)]
    species: Option<String>,

    #[arg(long)]
    cell_type: Option<String>,

    #[arg(long)]
    source: Option<SourceKind>,

    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    species: Option<String>,

    #[arg(long)]
    data_type: Option<DataType>,
}

#[derive(Args)]
struct DownloadArgs {
    specifier: String,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct SpecArgs {
    specifier: String,
}

#[derive(Args)]
struct RegisterArgs {
    specifier: String,

    #[arg(long)]
    atlas: Option<String>,

    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct AtlasArgs {
    name: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<AtlasregError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AtlasregError) -> u8 {
    match error {
        AtlasregError::NotAvailable(_)
        | AtlasregError::MissingAtlas { .. }
        | AtlasregError::NotDownloaded(_) => 2,
        AtlasregError::NetworkFailure { .. } | AtlasregError::HttpStatus { .. } => 3,
        AtlasregError::UnsupportedFormat { .. }
        | AtlasregError::EmptyDataset(_)
        | AtlasregError::Nrrd(_)
        | AtlasregError::OutOfBounds { .. }
        | AtlasregError::InvalidGeometry(_)
        | AtlasregError::ResampleFailed { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::from_config(config)?;

    match cli.command {
        Commands::Search(args) => run_search(args, &app, output_mode),
        Commands::List(args) => run_list(args, &app, output_mode),
        Commands::Download(args) => run_download(args, &app, output_mode),
        Commands::Info(args) => run_info(args, &app, output_mode),
        Commands::Remove(args) => run_remove(args, &app, output_mode),
        Commands::Register(args) => run_register(args, &app, output_mode),
        Commands::Atlas(args) => run_atlas(args, &app, output_mode),
    }
}

fn run_search(args: SearchArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let query = SearchQuery {
        structure: args.structure,
        species: args.species,
        cell_type: args.cell_type,
        limit: args.limit.unwrap_or(app.config().search_limit).max(1),
    };
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.search(query, args.source, &JsonOutput)?;
            JsonOutput::print_search(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let result = app.search(query, args.source, &ConsoleOutput)?;
            print_search_summary(&result);
            Ok(())
        }
    }
}

fn run_list(args: ListArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let species = args.species.as_deref();
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.list(species, args.data_type, &JsonOutput)?;
            JsonOutput::print_list(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let result = app.list(species, args.data_type, &ConsoleOutput)?;
            print_list_summary(&result);
            Ok(())
        }
    }
}

fn run_download(args: DownloadArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let specifier: DatasetSpecifier = args.specifier.parse()?;
    let options = DownloadOptions { force: args.force };
    match output_mode {
        OutputMode::NonInteractive => {
            let outcome = app.download(&specifier, options, &mut |_, _| {}, &JsonOutput)?;
            JsonOutput::print_download(&outcome).into_diagnostic()
        }
        OutputMode::Interactive => {
            let id = app.resolve(&specifier, &ConsoleOutput)?;
            let pool = WorkerPool::new(1);
            let handle = app.spawn_download(&pool, id, options);
            let bar = byte_progress_bar()?;
            loop {
                match handle.progress().recv_timeout(Duration::from_millis(100)) {
                    Ok(update) => {
                        bar.set_length(update.total);
                        bar.set_position(update.completed);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            let outcome = handle.wait();
            bar.finish_and_clear();
            let outcome = outcome?;
            print_download_summary(&outcome);
            Ok(())
        }
    }
}

fn run_info(args: SpecArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let specifier: DatasetSpecifier = args.specifier.parse()?;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.info(&specifier, &JsonOutput)?;
            JsonOutput::print_info(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let result = app.info(&specifier, &ConsoleOutput)?;
            print_info_summary(&result);
            Ok(())
        }
    }
}

fn run_remove(args: SpecArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let specifier: DatasetSpecifier = args.specifier.parse()?;
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.remove(&specifier, &JsonOutput)?;
            JsonOutput::print_remove(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let result = app.remove(&specifier, &ConsoleOutput)?;
            if result.removed {
                println!("{GREEN}Removed {}{RESET}", result.dataset_id);
            } else {
                println!("{YELLOW}{} was not in the cache{RESET}", result.dataset_id);
            }
            Ok(())
        }
    }
}

fn run_register(args: RegisterArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let specifier: DatasetSpecifier = args.specifier.parse()?;
    let atlas = args.atlas.as_deref();
    let output = args.output.as_deref();
    match output_mode {
        OutputMode::NonInteractive => {
            let result = app.register(&specifier, atlas, output, &mut |_, _| {}, &JsonOutput)?;
            JsonOutput::print_registration(&result).into_diagnostic()
        }
        OutputMode::Interactive => {
            let bar = byte_progress_bar()?;
            let result = app.register(
                &specifier,
                atlas,
                output,
                &mut |completed: u64, total: u64| {
                    bar.set_length(total);
                    bar.set_position(completed);
                },
                &ConsoleOutput,
            );
            bar.finish_and_clear();
            print_registration_summary(&result?);
            Ok(())
        }
    }
}

fn run_atlas(args: AtlasArgs, app: &App, output_mode: OutputMode) -> miette::Result<()> {
    let result = app.atlas_status(&args.name);
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_atlas(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_atlas_summary(&result);
            Ok(())
        }
    }
}

fn byte_progress_bar() -> miette::Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] \
                 {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .into_diagnostic()?
            .progress_chars("#>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

fn print_search_summary(result: &SearchResult) {
    println!("{CYAN}Found {} datasets{RESET}", result.datasets.len());
    for row in &result.datasets {
        println!(
            "  {} [{}] {} {} ({}, {:.1} MB)",
            row.id,
            row.status,
            row.species,
            row.structure.as_deref().unwrap_or("-"),
            row.format,
            row.size_mb
        );
    }
}

fn print_list_summary(result: &ListResult) {
    if result.datasets.is_empty() {
        println!("{YELLOW}No datasets known. Try `atlasreg search`.{RESET}");
        return;
    }
    for row in &result.datasets {
        let color = match row.status {
            DownloadState::Downloaded => GREEN,
            DownloadState::AtlasRequired
            | DownloadState::Failed => YELLOW,
            _ => RESET,
        };
        println!(
            "{color}{} [{}] {} ({}, {}){RESET}",
            row.id, row.status, row.name, row.data_type, row.source
        );
    }
}

fn print_download_summary(outcome: &DownloadOutcome) {
    match outcome.action {
        DownloadAction::Downloaded => println!(
            "{GREEN}Downloaded {} ({} bytes){RESET}",
            outcome.dataset_id, outcome.bytes
        ),
        DownloadAction::Cached => println!("{CYAN}{} already cached{RESET}", outcome.dataset_id),
    }
    println!("  {}", outcome.data_file);
}

fn print_info_summary(result: &InfoResult) {
    let dataset = &result.dataset;
    println!("{CYAN}{}{RESET} [{}]", dataset.id, result.status);
    println!("  name: {}", dataset.name);
    println!("  source: {}", dataset.source_label);
    println!("  species: {}", dataset.species);
    println!("  atlas: {}", dataset.atlas.as_deref().unwrap_or("-"));
    println!("  type: {} ({})", dataset.data_type, dataset.format);
    println!("  {}", dataset.description);
    if let Some(path) = &result.data_file {
        println!("  file: {path}");
    }
    if let Some(when) = &result.downloaded_at {
        println!("  downloaded: {when}");
    }
}

fn print_registration_summary(result: &RegistrationResult) {
    let summary = &result.summary;
    println!(
        "{GREEN}Registered {} into {} v{}{RESET}",
        result.dataset_id, result.atlas, result.atlas_version
    );
    if summary.dropped > 0 {
        println!(
            "{YELLOW}  kept {} of {} points, {} outside the atlas{RESET}",
            summary.kept, summary.total, summary.dropped
        );
    } else if let (Some(shape), Some(source)) = (summary.shape, summary.source_shape) {
        println!(
            "  volume {source:?} -> {shape:?} ({})",
            summary.strategy.unwrap_or("identity")
        );
    } else {
        println!("  {} points", summary.kept);
    }
    if let Some(path) = &result.output {
        println!("  written to {}", path.display());
    }
}

fn print_atlas_summary(result: &AtlasResult) {
    match &result.status {
        AtlasStatus::NotDownloaded => {
            println!("{YELLOW}{} is not downloaded{RESET}", result.atlas)
        }
        AtlasStatus::UpToDate { version } => {
            println!("{GREEN}{} v{version} is up to date{RESET}", result.atlas)
        }
        AtlasStatus::UpdateAvailable { local, latest } => println!(
            "{YELLOW}{} v{local} has an update: v{latest}{RESET}",
            result.atlas
        ),
        AtlasStatus::Unknown { local } => println!(
            "{CYAN}{} v{local} (latest version unknown){RESET}",
            result.atlas
        ),
    }
    if let Some(frame) = &result.frame {
        println!(
            "  resolution {:?}, shape {:?}",
            frame.resolution, frame.shape
        );
    }
    if let Some(count) = result.structures {
        println!("  {count} structures");
    }
}
