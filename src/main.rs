use std::io::Read as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::DateTime;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;

use owid_importer::draft::split_categories;
use owid_importer::settings::settings_path;
use owid_importer::{
    ActivityJournal, ApiClient, AppConfig, CommonsClient, ImportSession, ImportSettings,
    LinkOutcome, LinkResolver, OverwriteBehaviour, SessionStore, Task, TaskProcess, TaskSnapshot,
    TaskType, WatchObserver, WatchUpdate, SESSION_SERVICE_NAME,
};

#[derive(Parser)]
#[command(
    name = "owid-importer",
    version,
    about = "Console client for the OWID chart and map importer backend"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Adopt a browser session id minted by the wiki OAuth flow
    Login { session_id: String },
    /// Show who the stored session belongs to
    Whoami,
    /// Invalidate the session on the server and forget it locally
    Logout,
    /// List recent tasks
    Tasks {
        #[arg(long, value_enum, default_value = "map")]
        task_type: TaskTypeArg,
    },
    /// Show one task with its per-region processes
    Status { task_id: String },
    /// Resolve one grapher URL, create a task, and optionally watch it
    Import {
        url: String,
        /// Override the file name format
        #[arg(long)]
        file_name: Option<String>,
        /// Override the description template
        #[arg(long)]
        description: Option<String>,
        /// What to do when a file already exists on Commons
        #[arg(long, value_enum)]
        overwrite: Option<OverwriteArg>,
        /// Skip the per-country chart uploads
        #[arg(long)]
        no_countries: bool,
        /// Skip generating the Commons template
        #[arg(long)]
        no_template: bool,
        #[arg(long, value_enum, default_value = "map")]
        task_type: TaskTypeArg,
        /// Follow live updates until the task settles
        #[arg(long)]
        watch: bool,
    },
    /// Resolve a batch of grapher URLs from a file or stdin
    Resolve {
        /// File with one URL per line; reads stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,
        /// Create a task for every link that resolved
        #[arg(long)]
        submit: bool,
        #[arg(long, value_enum, default_value = "map")]
        task_type: TaskTypeArg,
    },
    /// Follow live updates for an existing task until it settles
    Watch { task_id: String },
    /// Re-queue a failed, cancelled, or partially failed task
    Retry { task_id: String },
    /// Cancel a queued or processing task
    Cancel { task_id: String },
    /// Search Commons categories by prefix
    Categories { prefix: String },
    /// Operator defaults used to prefill new imports
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Print the current settings as JSON
    Show,
    /// Print where the settings file lives
    Path,
    /// Restore the built-in defaults
    Reset,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TaskTypeArg {
    Map,
    Chart,
}

impl From<TaskTypeArg> for TaskType {
    fn from(value: TaskTypeArg) -> Self {
        match value {
            TaskTypeArg::Map => TaskType::Map,
            TaskTypeArg::Chart => TaskType::Chart,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OverwriteArg {
    All,
    AllExceptCategories,
    OnlyFile,
}

impl From<OverwriteArg> for OverwriteBehaviour {
    fn from(value: OverwriteArg) -> Self {
        match value {
            OverwriteArg::All => OverwriteBehaviour::All,
            OverwriteArg::AllExceptCategories => OverwriteBehaviour::AllExceptCategories,
            OverwriteArg::OnlyFile => OverwriteBehaviour::OnlyFile,
        }
    }
}

struct App {
    config: AppConfig,
    api: ApiClient,
    commons: CommonsClient,
    journal: ActivityJournal,
    settings_file: PathBuf,
    settings: ImportSettings,
}

impl App {
    fn bootstrap() -> anyhow::Result<Self> {
        let config = AppConfig::from_env();
        let data_dir = config.data_dir().context("resolving data directory")?;
        let api = ApiClient::new(&config, SessionStore::new(SESSION_SERVICE_NAME))?;
        let commons = CommonsClient::new(&config)?;
        let journal = ActivityJournal::new(&data_dir, &config)?;
        let settings_file = settings_path(&data_dir);
        let settings = ImportSettings::load(&settings_file)?;
        Ok(Self {
            config,
            api,
            commons,
            journal,
            settings_file,
            settings,
        })
    }

    fn import_session(&self) -> ImportSession {
        ImportSession::new(self.api.clone(), self.config.clone(), self.journal.clone())
    }

    fn resolver(&self) -> LinkResolver {
        LinkResolver::new(
            &self.config,
            self.settings.clone(),
            Arc::new(self.api.clone()),
            Arc::new(self.commons.clone()),
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    owid_importer::init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let app = App::bootstrap()?;
    let result = dispatch(&app, cli.command).await;
    if let Err(err) = app.journal.flush() {
        warn!(?err, "failed to flush the activity journal");
    }
    result
}

async fn dispatch(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { session_id } => {
            let session = app.api.adopt_session(&session_id).await?;
            println!("logged in as {}", session.username);
        }
        Command::Whoami => {
            let username = app.api.verify_session().await?;
            println!("{username}");
        }
        Command::Logout => {
            app.api.logout().await?;
            println!("logged out");
        }
        Command::Tasks { task_type } => {
            let tasks = app.api.fetch_tasks(task_type.into()).await?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in &tasks {
                print_task_line(task);
            }
        }
        Command::Status { task_id } => {
            let snapshot = app.api.fetch_task(&task_id).await?;
            print_snapshot(&snapshot);
        }
        Command::Import {
            url,
            file_name,
            description,
            overwrite,
            no_countries,
            no_template,
            task_type,
            watch,
        } => {
            let mut draft = app.resolver().resolve_link(&url).await?;
            if let Some(name) = file_name {
                draft.file_name = name;
            }
            if let Some(text) = description {
                draft.description = text;
            }
            if let Some(behaviour) = overwrite {
                draft.description_overwrite_behaviour = behaviour.into();
            }
            if no_countries {
                draft.import_countries = false;
            }
            if no_template {
                draft.generate_template_commons = false;
            }
            if draft.template_exists {
                println!("note: a generated Commons template already exists for this chart");
            }

            let mut session = app.import_session();
            let outcome = session.submit(&[draft], task_type.into()).await?;
            if let Some(task_id) = outcome.created.first() {
                println!("created task {task_id}");
            }

            if watch {
                session.watch_until_settled(Some(watch_observer())).await?;
                summarize(&session);
            }
            session.reset().await;
        }
        Command::Resolve {
            file,
            submit,
            task_type,
        } => {
            let input = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin().read_to_string(&mut buffer)?;
                    buffer
                }
            };
            let links = LinkResolver::parse_links(&input);
            let batch = app.resolver().resolve_batch(&links).await?;
            for link in &batch.links {
                match link.outcome {
                    LinkOutcome::Done => println!("done    {}", link.url),
                    LinkOutcome::Failed => println!("failed  {}", link.url),
                }
            }

            if submit && !batch.drafts.is_empty() {
                let mut session = app.import_session();
                let outcome = session.submit(&batch.drafts, task_type.into()).await?;
                for task_id in &outcome.created {
                    println!("created task {task_id}");
                }
                for rejected in &outcome.rejected {
                    eprintln!("rejected {}: {}", rejected.url, rejected.reason);
                }
                session.reset().await;
            }
        }
        Command::Watch { task_id } => {
            let mut session = app.import_session();
            session.observe(&task_id).await?;
            if let Some(task) = session.observation().task() {
                println!("watching task {} ({})", task.id, task.status);
            }
            session.watch_until_settled(Some(watch_observer())).await?;
            summarize(&session);
            session.reset().await;
        }
        Command::Retry { task_id } => {
            let mut session = app.import_session();
            session.observe(&task_id).await?;
            session.retry().await?;
            println!("retry requested for task {task_id}");
            session.reset().await;
        }
        Command::Cancel { task_id } => {
            let mut session = app.import_session();
            session.observe(&task_id).await?;
            session.cancel().await?;
            if let Some(task) = session.observation().task() {
                println!("task {} is now {}", task.id, task.status);
            }
            session.reset().await;
        }
        Command::Categories { prefix } => {
            let categories = app.commons.search_categories(&prefix).await?;
            if categories.is_empty() {
                println!("no matching categories");
            }
            for name in categories {
                println!("{name}");
            }
        }
        Command::Settings { action } => match action {
            SettingsCommand::Show => {
                println!("{}", serde_json::to_string_pretty(&app.settings)?);
            }
            SettingsCommand::Path => {
                println!("{}", app.settings_file.display());
            }
            SettingsCommand::Reset => {
                ImportSettings::default().persist(&app.settings_file)?;
                println!("settings reset to defaults at {}", app.settings_file.display());
            }
        },
    }
    Ok(())
}

fn watch_observer() -> WatchObserver {
    Arc::new(|update: &WatchUpdate| match update {
        WatchUpdate::Process(process) => print_process("", process),
        WatchUpdate::TaskRefreshed(task) => println!("task status: {}", task.status),
        WatchUpdate::Progress(message) => println!("... {message}"),
        WatchUpdate::Notice(message) => println!("{message}"),
        WatchUpdate::ServerError(message) => eprintln!("server error: {message}"),
        WatchUpdate::WikiText(_) => println!("wikitext received"),
        WatchUpdate::Reconnecting { attempt } => println!("reconnecting (attempt {attempt})..."),
        WatchUpdate::ChannelDown(close) => println!("{}", close.describe()),
    })
}

fn summarize(session: &ImportSession) {
    let observation = session.observation();
    if let Some(task) = observation.task() {
        let failed = observation.failed_count();
        if failed > 0 {
            println!("finished: {} ({failed} failed processes)", task.status);
        } else {
            println!("finished: {}", task.status);
        }
    }
}

fn print_task_line(task: &Task) {
    println!(
        "{}  {:<10}  {:<5}  {}  {}",
        task.id,
        task.status,
        task.task_type,
        format_timestamp(task.created_at),
        task.chart_name
    );
}

fn print_snapshot(snapshot: &TaskSnapshot) {
    let task = &snapshot.task;
    println!("task {}", task.id);
    println!("  status:   {}", task.status);
    println!("  type:     {}", task.task_type);
    if !task.chart_name.is_empty() {
        println!("  chart:    {}", task.chart_name);
    }
    println!("  url:      {}", task.url);
    println!("  file:     {}", task.file_name);
    let (_, categories) = split_categories(&task.description);
    if !categories.is_empty() {
        println!("  categories: {}", categories.join(", "));
    }
    if let Some(template) = &task.commons_template_name {
        println!("  template: {template}");
    }
    println!("  created:  {}", format_timestamp(task.created_at));
    if !snapshot.processes.is_empty() {
        println!("  processes:");
        for process in &snapshot.processes {
            print_process("    ", process);
        }
    }
    if let Some(wiki_text) = &snapshot.wiki_text {
        println!("  wikitext: {} bytes available", wiki_text.len());
    }
}

fn print_process(indent: &str, process: &TaskProcess) {
    let period = process.period().unwrap_or_default();
    let mut line = format!("{indent}{}: {} - {}", process.region, period, process.status);
    if !process.file_name.is_empty() {
        line.push_str(" -> File:");
        line.push_str(&process.file_name);
    }
    println!("{line}");
}

fn format_timestamp(secs: i64) -> String {
    if secs <= 0 {
        return "-".into();
    }
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}
