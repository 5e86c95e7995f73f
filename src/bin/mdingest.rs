use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use md_ingest::annotation::InterProScanClient;
use md_ingest::app::{App, LoadOptions, LoadReport};
use md_ingest::config::{ConfigLoader, ResolvedConfig};
use md_ingest::domain::ProjectRef;
use md_ingest::error::IngestError;
use md_ingest::forestall::{Decision, FixedDecision};
use md_ingest::output::{JsonOutput, TracingProgress};
use md_ingest::store::http::HttpStore;

#[derive(Parser)]
#[command(name = "mdingest")]
#[command(about = "Load molecular dynamics projects into a remote document store")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load (or resume loading) a project directory")]
    Load(LoadArgs),
    #[command(about = "Ask a running load of a project to stop")]
    Abort(AbortArgs),
}

#[derive(Args)]
struct LoadArgs {
    #[arg(default_value = ".")]
    dir: Utf8PathBuf,
    #[arg(long)]
    project: Option<String>,
    #[arg(long = "md")]
    mds: Vec<Utf8PathBuf>,
    #[arg(long)]
    conserve: bool,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    skip_chains: bool,
    #[arg(long)]
    publish: bool,
}

#[derive(Args)]
struct AbortArgs {
    #[arg(long)]
    project: String,
    /// Clear the flag instead of raising it.
    #[arg(long)]
    clear: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::ConflictingFlags
        | IngestError::InvalidProjectRef(_)
        | IngestError::ProjectNotFound(_)
        | IngestError::MissingFile(_)
        | IngestError::InvalidDocument { .. }
        | IngestError::MdIndexMismatch { .. }
        | IngestError::DuplicateMdRun(_)
        | IngestError::Codec(_)
        | IngestError::InvalidPattern { .. }
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_)
        | IngestError::MissingStoreUrl => 2,
        error if error.is_transport() => 3,
        error if error.is_cancelled() => 4,
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
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    match cli.command {
        Commands::Load(args) => runtime.block_on(run_load(args, config, cli.non_interactive)),
        Commands::Abort(args) => runtime.block_on(run_abort(args, config, cli.non_interactive)),
    }
}

fn build_app(
    config: ResolvedConfig,
    non_interactive: bool,
) -> miette::Result<App<HttpStore, InterProScanClient>> {
    let url = config
        .store
        .url
        .clone()
        .ok_or(IngestError::MissingStoreUrl)?;
    let store = HttpStore::new(&url, config.store.timeout, config.upload.sink_queue_depth)?;
    let annotator = InterProScanClient::new(&config.annotation)?;
    let app = App::new(store, annotator, config);
    if non_interactive {
        return Ok(app.with_decisions(Box::new(FixedDecision(Decision::Skip))));
    }
    Ok(app)
}

async fn run_load(args: LoadArgs, config: ResolvedConfig, non_interactive: bool) -> miette::Result<()> {
    let project = args
        .project
        .as_deref()
        .map(str::parse::<ProjectRef>)
        .transpose()?;
    let options = LoadOptions {
        project,
        mds: args.mds,
        conserve: args.conserve,
        overwrite: args.overwrite,
        skip_chains: args.skip_chains,
        publish: args.publish,
    };
    let app = build_app(config, non_interactive)?;

    let report = if non_interactive {
        app.load(&args.dir, options, &JsonOutput).await?
    } else {
        app.load(&args.dir, options, &TracingProgress).await?
    };

    if non_interactive {
        JsonOutput::print_report(&report).into_diagnostic()?;
    } else {
        print_load_summary(&report);
    }
    Ok(())
}

async fn run_abort(args: AbortArgs, config: ResolvedConfig, non_interactive: bool) -> miette::Result<()> {
    let reference: ProjectRef = args.project.parse()?;
    let app = build_app(config, non_interactive)?;
    let result = app.abort(&reference, !args.clear).await?;
    if non_interactive {
        JsonOutput::print_abort(&result).into_diagnostic()?;
    } else if result.abort {
        println!("Abort requested for project {}", result.project);
    } else {
        println!("Abort flag cleared for project {}", result.project);
    }
    Ok(())
}

fn print_load_summary(report: &LoadReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";
    let accession = report.accession.as_deref().unwrap_or("-");
    println!(
        "{cyan}Project {} ({accession}), {:?}{reset}",
        report.project, report.resolution
    );
    let rows = [
        ("metadata fields", report.metadata),
        ("references", report.references),
        ("topology", report.topology),
        ("MD metadata", report.md_metadata),
        ("files", report.files),
        ("trajectories", report.trajectories),
        ("analyses", report.analyses),
    ];
    for (label, counts) in rows {
        println!(
            "{green}  {label}: {} loaded{reset}, {yellow}{} kept{reset}",
            counts.loaded, counts.skipped
        );
    }
    for md in &report.mds {
        match md.trajectory {
            Some(info) => println!(
                "  md{} {}: {} frames x {} atoms",
                md.index, md.name, info.frames, info.atoms
            ),
            None => println!("  md{} {}", md.index, md.name),
        }
    }
    println!(
        "{green}  chains: {} stored from {} jobs{reset}",
        report.chains.chains_stored, report.annotation_jobs
    );
    if report.chains.jobs_failed > 0 {
        println!(
            "{yellow}  annotation jobs failed: {}{reset}",
            report.chains.jobs_failed
        );
    }
    if report.published {
        println!("{green}  published{reset}");
    }
}
