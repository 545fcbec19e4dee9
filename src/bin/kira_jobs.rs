use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;

use kira_sample_jobs::app::App;
use kira_sample_jobs::config::ConfigLoader;
use kira_sample_jobs::dispatch::{Dispatcher, LogObserver, QueueDispatcher};
use kira_sample_jobs::domain::{FileId, JobId, SampleId};
use kira_sample_jobs::error::KiraError;
use kira_sample_jobs::logging;
use kira_sample_jobs::output::JsonOutput;
use kira_sample_jobs::process::{SystemProcessRunner, resolve_tool};
use kira_sample_jobs::update_sample::{UpdateSampleArgs, parse_replacement};

#[derive(Parser)]
#[command(name = "kira-jobs")]
#[command(
    about = "Staged jobs that replace a sample's read files while preserving the old generation"
)]
#[command(version, author)]
struct Cli {
    /// Settings file (defaults to ./kira-jobs.json when present).
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Overrides the configured data directory.
    #[arg(long, global = true)]
    data_path: Option<Utf8PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create, run and inspect jobs")]
    Job(JobArgs),
    #[command(about = "Manage uploaded files")]
    Files(FilesArgs),
}

#[derive(Args)]
struct JobArgs {
    #[command(subcommand)]
    command: JobCommand,
}

#[derive(Subcommand)]
enum JobCommand {
    #[command(about = "Enqueue a new job")]
    Create(CreateArgs),
    #[command(about = "Run a job, resuming from its last checkpoint")]
    Run(JobIdArg),
    #[command(about = "Print the stored job record")]
    Status(JobIdArg),
    #[command(about = "Print every job record")]
    List,
    #[command(about = "Abort a job before its next stage")]
    Cancel(JobIdArg),
}

#[derive(Args)]
struct CreateArgs {
    #[command(subcommand)]
    task: CreateTask,
}

#[derive(Subcommand)]
enum CreateTask {
    #[command(about = "Replace a sample's read files with uploads")]
    UpdateSample(UpdateSampleCli),
}

#[derive(Args)]
struct UpdateSampleCli {
    #[arg(long)]
    sample: String,

    #[arg(long)]
    paired: bool,

    /// `<old-file-name>=<upload-id>`, in read order.
    #[arg(long = "replace")]
    replace: Vec<String>,
}

#[derive(Args)]
struct JobIdArg {
    id: String,
}

#[derive(Args)]
struct FilesArgs {
    #[command(subcommand)]
    command: FilesCommand,
}

#[derive(Subcommand)]
enum FilesCommand {
    #[command(about = "List uploads that are ready and unreserved")]
    List {
        #[arg(long = "type")]
        file_type: Option<String>,
    },
    #[command(about = "Delete an upload")]
    Remove { id: String },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::NotFound { .. }
        | KiraError::Validation(_)
        | KiraError::InvalidIdentifier(_) => 2,
        KiraError::ToolExecution { .. }
        | KiraError::QcParse { .. }
        | KiraError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let mut settings = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(data_path) = cli.data_path {
        settings.data_path = data_path;
    }
    logging::init(cli.verbose, settings.log_dir.as_deref())?;

    let fastqc = settings.fastqc_path.clone();
    let dispatcher = Arc::new(QueueDispatcher::start(settings.dispatch_capacity));
    dispatcher.subscribe(Arc::new(LogObserver));
    let app = App::open(
        settings,
        Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        Arc::new(SystemProcessRunner),
    )?;

    let result = match cli.command {
        Commands::Job(args) => run_job_command(&app, &fastqc, args.command),
        Commands::Files(args) => run_files_command(&app, args.command),
    };

    dispatcher.shutdown();
    if dispatcher.dropped() > 0 {
        warn!(dropped = dispatcher.dropped(), "notifications were dropped");
    }
    result
}

fn run_job_command(app: &App, fastqc: &str, command: JobCommand) -> miette::Result<()> {
    let job = match command {
        JobCommand::Create(args) => match args.task {
            CreateTask::UpdateSample(args) => {
                let sample_id: SampleId = args.sample.parse()?;
                let files = args
                    .replace
                    .iter()
                    .map(|raw| parse_replacement(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                app.create_update_sample(&UpdateSampleArgs {
                    sample_id,
                    paired: args.paired,
                    files,
                })?
            }
        },
        JobCommand::Run(arg) => {
            let job_id = parse_job_id(&arg.id)?;
            resolve_tool(fastqc)?;
            app.run_job(&job_id)?
        }
        JobCommand::List => {
            let jobs = app.list_jobs()?;
            return JsonOutput::print_jobs(&jobs).into_diagnostic();
        }
        JobCommand::Status(arg) => app.job_status(&parse_job_id(&arg.id)?)?,
        JobCommand::Cancel(arg) => app.cancel_job(&parse_job_id(&arg.id)?)?,
    };
    JsonOutput::print_job(&job).into_diagnostic()
}

fn run_files_command(app: &App, command: FilesCommand) -> miette::Result<()> {
    match command {
        FilesCommand::List { file_type } => {
            let files = app.list_files(file_type.as_deref())?;
            JsonOutput::print_files(&files).into_diagnostic()
        }
        FilesCommand::Remove { id } => {
            let file_id: FileId = id.parse()?;
            app.remove_file(&file_id)?;
            JsonOutput::print_removed(file_id.as_str()).into_diagnostic()
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, KiraError> {
    raw.parse()
}
