//! Jot CLI - notes and checklists from the command line
//!
//! Quick capture with minimal friction. Every command works offline;
//! changes queue locally and replay against the sync server once the
//! device is online and signed in.

use std::env;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::aot::Generator;
use clap_complete::{generate, shells};
use jot_core::db::{Database, SqliteStore};
use jot_core::models::TodoItem;
use jot_core::sync::{HttpRemoteStore, ImportStrategy, SyncQueue};
use jot_core::util;
use jot_core::{
    Collection, ConnectivityMonitor, Entity, EntityId, Note, Snapshot, StateManager,
    SyncCoordinator, Todo,
};
use serde::Serialize;
use thiserror::Error;

mod config;

use config::CliConfig;

#[derive(Parser)]
#[command(name = "jot")]
#[command(about = "Notes and checklists that sync when they can")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Quick capture: jot "my note here"
    #[arg(trailing_var_arg = true)]
    note: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },
    /// Work with checklists
    Todo {
        #[command(subcommand)]
        command: TodoCommands,
    },
    /// Reorder a record within its list
    Move {
        /// Record ID or unique ID prefix
        id: String,
        /// Swap with the record above
        #[arg(long)]
        up: bool,
        /// Swap with the record below
        #[arg(long)]
        down: bool,
        /// Move to a position in the rendered list (0 is the top)
        #[arg(long, value_name = "INDEX")]
        to: Option<usize>,
        /// Move above everything else in the list
        #[arg(long)]
        top: bool,
    },
    /// Export notes, checklists and settings as JSON
    Export {
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Import a previously exported document
    Import {
        /// Path to the export file
        path: PathBuf,
        /// How to treat records that already exist locally
        #[arg(long, value_enum, default_value_t = ImportStrategyArg::Merge)]
        strategy: ImportStrategyArg,
    },
    /// Replay queued changes against the sync server
    Sync,
    /// Show connectivity, session and queue state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Store sync credentials and replay anything queued
    Login {
        /// Account user id
        #[arg(long)]
        user: String,
        /// Access token for the sync server
        #[arg(long)]
        token: String,
        /// Base URL of the sync server
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
    },
    /// Forget stored sync credentials
    Logout,
    /// Mark the network as reachable and replay queued changes
    Online,
    /// Keep all changes local until `jot online`
    Offline,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum NoteCommands {
    /// Create a new note
    #[command(alias = "new")]
    Add {
        /// Note title
        title: Vec<String>,
        /// Note body
        #[arg(long)]
        content: Option<String>,
        /// Card color as #RGB or #RRGGBB hex
        #[arg(long)]
        color: Option<String>,
    },
    /// List notes in render order
    List {
        /// Number of notes to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing note (opens $EDITOR when no flags are given)
    Edit {
        /// Note ID or unique ID prefix
        id: String,
        /// New title
        #[arg(long)]
        title: Option<String>,
        /// New body
        #[arg(long)]
        content: Option<String>,
        /// New color
        #[arg(long)]
        color: Option<String>,
    },
    /// Delete an existing note
    Delete {
        /// Note ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
enum TodoCommands {
    /// Create a new checklist
    #[command(alias = "new")]
    Add {
        /// Checklist title
        title: Vec<String>,
        /// Card color as #RGB or #RRGGBB hex
        #[arg(long)]
        color: Option<String>,
    },
    /// List checklists and their items in render order
    List {
        /// Number of checklists to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an existing checklist
    Delete {
        /// Checklist ID or unique ID prefix
        id: String,
    },
    /// Check off an item
    Check {
        /// Checklist ID or unique ID prefix
        todo: String,
        /// Item ID or unique ID prefix
        item: String,
    },
    /// Uncheck an item
    Uncheck {
        /// Checklist ID or unique ID prefix
        todo: String,
        /// Item ID or unique ID prefix
        item: String,
    },
    /// Append an item to a checklist
    ItemAdd {
        /// Checklist ID or unique ID prefix
        todo: String,
        /// Item text
        text: Vec<String>,
    },
    /// Remove an item from a checklist
    ItemRemove {
        /// Checklist ID or unique ID prefix
        todo: String,
        /// Item ID or unique ID prefix
        item: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a starter config file
    Init {
        /// Base URL of the sync server
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
    },
    /// Print the stored configuration
    Show,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] jot_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error("No title provided")]
    EmptyTitle,
    #[error("No item text provided")]
    EmptyItemText,
    #[error("Record ID cannot be empty")]
    EmptyId,
    #[error("Record not found for id/prefix: {0}")]
    RecordNotFound(String),
    #[error("No checklist item found for id/prefix: {0}")]
    ItemNotFound(String),
    #[error("{0}")]
    AmbiguousId(String),
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error("Specify exactly one of --up, --down, --to or --top")]
    InvalidMoveFlags,
    #[error(
        "Sync is not configured. Run `jot config init --api-url <URL>` and `jot login` first."
    )]
    SyncNotConfigured,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ImportStrategyArg {
    Merge,
    Replace,
    Skip,
}

impl From<ImportStrategyArg> for ImportStrategy {
    fn from(strategy: ImportStrategyArg) -> Self {
        match strategy {
            ImportStrategyArg::Merge => Self::Merge,
            ImportStrategyArg::Replace => Self::Replace,
            ImportStrategyArg::Skip => Self::Skip,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MoveTarget {
    Up,
    Down,
    Top,
    To(usize),
}

impl MoveTarget {
    fn from_flags(up: bool, down: bool, to: Option<usize>, top: bool) -> Result<Self, CliError> {
        match (up, down, to, top) {
            (true, false, None, false) => Ok(Self::Up),
            (false, true, None, false) => Ok(Self::Down),
            (false, false, Some(index), false) => Ok(Self::To(index)),
            (false, false, None, true) => Ok(Self::Top),
            _ => Err(CliError::InvalidMoveFlags),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jot=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config = CliConfig::load().map_err(CliError::Config)?;

    match cli.command {
        Some(Commands::Note { command }) => match command {
            NoteCommands::Add {
                title,
                content,
                color,
            } => run_note_add(&title, content, color, &db_path, &config).await?,
            NoteCommands::List { limit, json } => run_note_list(limit, json, &db_path, &config)?,
            NoteCommands::Edit {
                id,
                title,
                content,
                color,
            } => run_note_edit(&id, title, content, color, &db_path, &config).await?,
            NoteCommands::Delete { id } => run_note_delete(&id, &db_path, &config).await?,
        },
        Some(Commands::Todo { command }) => match command {
            TodoCommands::Add { title, color } => {
                run_todo_add(&title, color, &db_path, &config).await?;
            }
            TodoCommands::List { limit, json } => run_todo_list(limit, json, &db_path, &config)?,
            TodoCommands::Delete { id } => run_todo_delete(&id, &db_path, &config).await?,
            TodoCommands::Check { todo, item } => {
                run_todo_set_checked(&todo, &item, true, &db_path, &config).await?;
            }
            TodoCommands::Uncheck { todo, item } => {
                run_todo_set_checked(&todo, &item, false, &db_path, &config).await?;
            }
            TodoCommands::ItemAdd { todo, text } => {
                run_todo_item_add(&todo, &text, &db_path, &config).await?;
            }
            TodoCommands::ItemRemove { todo, item } => {
                run_todo_item_remove(&todo, &item, &db_path, &config).await?;
            }
        },
        Some(Commands::Move {
            id,
            up,
            down,
            to,
            top,
        }) => {
            let target = MoveTarget::from_flags(up, down, to, top)?;
            run_move(&id, target, &db_path, &config).await?;
        }
        Some(Commands::Export { output }) => run_export(output.as_deref(), &db_path, &config)?,
        Some(Commands::Import { path, strategy }) => {
            run_import(&path, strategy, &db_path, &config).await?;
        }
        Some(Commands::Sync) => run_sync(&db_path, &config).await?,
        Some(Commands::Status { json }) => run_status(json, &db_path, &config)?,
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Init { api_url } => run_config_init(api_url, &config)?,
            ConfigCommands::Show => run_config_show(&config)?,
        },
        Some(Commands::Login {
            user,
            token,
            api_url,
        }) => run_login(user, token, api_url, &db_path, &config).await?,
        Some(Commands::Logout) => run_logout(&config)?,
        Some(Commands::Online) => run_online(&db_path, &config).await?,
        Some(Commands::Offline) => run_offline(&config)?,
        Some(Commands::Completions { shell, output }) => {
            run_completions(shell, output.as_deref())?;
        }
        None => {
            // Quick capture mode: jot "my note"
            if cli.note.is_empty() {
                Cli::command().print_help().map_err(CliError::Io)?;
                println!();
            } else {
                run_note_add(&cli.note, None, None, &db_path, &config).await?;
            }
        }
    }

    Ok(())
}

/// A live view over one local database, wired for sync
struct App {
    state: StateManager,
    monitor: Arc<ConnectivityMonitor>,
}

/// Placeholder endpoint used while no credentials are configured. The
/// monitor never reports eligibility without a signed-in user, so this
/// address is never contacted.
const FALLBACK_API_URL: &str = "http://localhost:9";

fn open_app(db_path: &Path, config: &CliConfig) -> Result<App, CliError> {
    let db = Arc::new(Database::open(db_path)?);
    let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
    let queue = SyncQueue::new(Arc::clone(&db));

    let monitor = Arc::new(ConnectivityMonitor::new());
    monitor.set_online(!config.offline);

    let credentials = remote_credentials(config);
    if let Some(credentials) = &credentials {
        monitor.sign_in(credentials.user.as_str());
        tracing::debug!("Sync configured for {}", credentials.api_url);
    }

    let remote = match credentials {
        Some(credentials) => {
            HttpRemoteStore::new(credentials.api_url, credentials.user, credentials.token)
        }
        None => HttpRemoteStore::new(FALLBACK_API_URL, "nobody", ""),
    }
    .map_err(|error| CliError::Config(error.to_string()))?;

    let coordinator = Arc::new(SyncCoordinator::new(
        store,
        Arc::new(remote),
        queue,
        Arc::clone(&monitor),
    ));
    let state = StateManager::new(coordinator)?;

    Ok(App { state, monitor })
}

struct RemoteCredentials {
    api_url: String,
    user: String,
    token: String,
}

/// Environment variables override the stored config, so one-off runs can
/// point at a different server without touching the config file.
fn remote_credentials(config: &CliConfig) -> Option<RemoteCredentials> {
    let api_url = env::var("JOT_API_URL")
        .ok()
        .and_then(|value| util::normalize_text_option(Some(value)))
        .or_else(|| config.api_base_url.clone())?;
    let user = env::var("JOT_USER_ID")
        .ok()
        .and_then(|value| util::normalize_text_option(Some(value)))
        .or_else(|| config.user_id.clone())?;
    let token = env::var("JOT_API_TOKEN")
        .ok()
        .and_then(|value| util::normalize_text_option(Some(value)))
        .or_else(|| config.access_token.clone())?;

    Some(RemoteCredentials {
        api_url,
        user,
        token,
    })
}

/// Replay queued changes after a command when the device is eligible.
/// Failures stay queued and never fail the command that triggered them.
async fn maybe_sync(app: &App) {
    if !app.monitor.state().is_eligible() {
        return;
    }

    match app.state.sync_now().await {
        Ok(report) if report.replayed > 0 => {
            tracing::info!(
                "Synced {} queued changes ({} conflicts)",
                report.replayed,
                report.conflicts
            );
        }
        Ok(_) => {}
        Err(error) => tracing::warn!("Sync failed, changes stay queued: {error}"),
    }
}

async fn run_note_add(
    title_parts: &[String],
    content: Option<String>,
    color: Option<String>,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let seed = resolve_note_seed(title_parts, content)?;
    let app = open_app(db_path, config)?;

    let color = color.unwrap_or_else(|| app.state.snapshot().settings.default_color);
    let note = app.state.create_note(seed.title, seed.content, color).await?;

    println!("{}", note.id);
    maybe_sync(&app).await;
    Ok(())
}

#[derive(Debug, Serialize)]
struct NoteListItem {
    id: String,
    title: String,
    preview: String,
    color: String,
    created_at: i64,
    updated_at: i64,
    relative_time: String,
}

fn run_note_list(
    limit: usize,
    as_json: bool,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let app = open_app(db_path, config)?;
    let snapshot = app.state.snapshot();
    let notes: Vec<Note> = snapshot.notes.into_iter().take(limit).collect();

    if as_json {
        let now_ms = Utc::now().timestamp_millis();
        let items = notes
            .iter()
            .map(|note| note_to_list_item(note, now_ms))
            .collect::<Vec<NoteListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_note_lines(&notes) {
            println!("{line}");
        }
    }

    Ok(())
}

async fn run_note_edit(
    id: &str,
    title: Option<String>,
    content: Option<String>,
    color: Option<String>,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let query = normalize_identifier(id)?;
    let app = open_app(db_path, config)?;
    let note = resolve_note(&app.state.snapshot(), &query)?;

    let (title, content, color) = if title.is_none() && content.is_none() && color.is_none() {
        let edited = capture_editor_input_with_initial(&note.content)?.unwrap_or_default();
        if edited == note.content {
            println!("{}", note.id);
            return Ok(());
        }
        (None, Some(edited), None)
    } else {
        (title, content, color)
    };

    let updated = app.state.update_note(note.id, title, content, color).await?;
    println!("{}", updated.id);
    maybe_sync(&app).await;
    Ok(())
}

async fn run_note_delete(id: &str, db_path: &Path, config: &CliConfig) -> Result<(), CliError> {
    let query = normalize_identifier(id)?;
    let app = open_app(db_path, config)?;
    let note = resolve_note(&app.state.snapshot(), &query)?;

    app.state.delete(Collection::Notes, note.id).await?;
    println!("{}", note.id);
    maybe_sync(&app).await;
    Ok(())
}

async fn run_todo_add(
    title_parts: &[String],
    color: Option<String>,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let title = normalize_title(title_parts)?;
    let app = open_app(db_path, config)?;

    let color = color.unwrap_or_else(|| app.state.snapshot().settings.default_color);
    let todo = app.state.create_todo(title, color).await?;

    println!("{}", todo.id);
    maybe_sync(&app).await;
    Ok(())
}

#[derive(Debug, Serialize)]
struct TodoListItem {
    id: String,
    title: String,
    color: String,
    completed_count: u32,
    total_count: u32,
    created_at: i64,
    updated_at: i64,
    relative_time: String,
    items: Vec<TodoItemView>,
}

#[derive(Debug, Serialize)]
struct TodoItemView {
    id: String,
    text: String,
    completed: bool,
}

fn run_todo_list(
    limit: usize,
    as_json: bool,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let app = open_app(db_path, config)?;
    let snapshot = app.state.snapshot();
    let todos: Vec<Todo> = snapshot.todos.into_iter().take(limit).collect();

    if as_json {
        let now_ms = Utc::now().timestamp_millis();
        let items = todos
            .iter()
            .map(|todo| todo_to_list_item(todo, now_ms))
            .collect::<Vec<TodoListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_todo_lines(&todos) {
            println!("{line}");
        }
    }

    Ok(())
}

async fn run_todo_delete(id: &str, db_path: &Path, config: &CliConfig) -> Result<(), CliError> {
    let query = normalize_identifier(id)?;
    let app = open_app(db_path, config)?;
    let todo = resolve_todo(&app.state.snapshot(), &query)?;

    app.state.delete(Collection::Todos, todo.id).await?;
    println!("{}", todo.id);
    maybe_sync(&app).await;
    Ok(())
}

async fn run_todo_set_checked(
    todo_query: &str,
    item_query: &str,
    checked: bool,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let todo_query = normalize_identifier(todo_query)?;
    let item_query = normalize_identifier(item_query)?;
    let app = open_app(db_path, config)?;

    let todo = resolve_todo(&app.state.snapshot(), &todo_query)?;
    let item = resolve_item(&todo, &item_query)?;

    if item.completed == checked {
        // Already in the requested state; nothing to record
        println!("{} [{}/{}]", todo.id, todo.completed_count, todo.total_count);
        return Ok(());
    }

    let updated = app.state.toggle_item(todo.id, item.id).await?;
    println!(
        "{} [{}/{}]",
        updated.id, updated.completed_count, updated.total_count
    );
    maybe_sync(&app).await;
    Ok(())
}

async fn run_todo_item_add(
    todo_query: &str,
    text_parts: &[String],
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let todo_query = normalize_identifier(todo_query)?;
    let text = normalize_item_text(text_parts)?;
    let app = open_app(db_path, config)?;

    let todo = resolve_todo(&app.state.snapshot(), &todo_query)?;
    let (_todo, item_id) = app.state.add_todo_item(todo.id, text).await?;

    println!("{item_id}");
    maybe_sync(&app).await;
    Ok(())
}

async fn run_todo_item_remove(
    todo_query: &str,
    item_query: &str,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let todo_query = normalize_identifier(todo_query)?;
    let item_query = normalize_identifier(item_query)?;
    let app = open_app(db_path, config)?;

    let todo = resolve_todo(&app.state.snapshot(), &todo_query)?;
    let item = resolve_item(&todo, &item_query)?;

    let updated = app.state.remove_item(todo.id, item.id).await?;
    println!(
        "{} [{}/{}]",
        updated.id, updated.completed_count, updated.total_count
    );
    maybe_sync(&app).await;
    Ok(())
}

async fn run_move(
    id: &str,
    target: MoveTarget,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let query = normalize_identifier(id)?;
    let app = open_app(db_path, config)?;

    let entity = resolve_entity(&all_entities(&app.state.snapshot()), &query)?;
    let collection = entity.collection();
    let entity_id = entity.id();

    let moved = match target {
        MoveTarget::Up => app.state.move_up(collection, entity_id).await?,
        MoveTarget::Down => app.state.move_down(collection, entity_id).await?,
        MoveTarget::Top => app.state.move_to_top(collection, entity_id).await?,
        MoveTarget::To(index) => app.state.move_to(collection, entity_id, index).await?,
    };

    println!("{}", moved.id());
    maybe_sync(&app).await;
    Ok(())
}

fn run_export(
    output_path: Option<&Path>,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let app = open_app(db_path, config)?;
    let rendered = app.state.export_document()?;

    if let Some(path) = output_path {
        let path = if path.is_dir() {
            path.join(jot_core::transfer::suggested_export_file_name(
                Utc::now().timestamp_millis(),
            ))
        } else {
            path.to_path_buf()
        };
        std::fs::write(&path, rendered)?;
        println!("{}", path.display());
    } else {
        println!("{rendered}");
    }

    Ok(())
}

async fn run_import(
    path: &Path,
    strategy: ImportStrategyArg,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let text = std::fs::read_to_string(path)?;
    let app = open_app(db_path, config)?;

    let summary = app.state.import_document(&text, strategy.into()).await?;
    println!(
        "Imported {} created, {} updated, {} skipped",
        summary.created, summary.updated, summary.skipped
    );
    if summary.settings_replaced {
        println!("Settings replaced from the file");
    }

    maybe_sync(&app).await;
    Ok(())
}

async fn run_sync(db_path: &Path, config: &CliConfig) -> Result<(), CliError> {
    if remote_credentials(config).is_none() {
        return Err(CliError::SyncNotConfigured);
    }

    let app = open_app(db_path, config)?;
    // An explicit sync overrides a stored offline flag for this run only
    app.monitor.set_online(true);

    let report = app.state.sync_now().await?;
    println!(
        "Replayed {} queued changes ({} conflicts, {} still queued)",
        report.replayed, report.conflicts, report.remaining
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    database: String,
    online: bool,
    authenticated: bool,
    user_id: Option<String>,
    api_base_url: Option<String>,
    pending_sync_entries: usize,
    notes: usize,
    todos: usize,
    conflicts_resolved: usize,
}

fn build_status_report(
    app: &App,
    db_path: &Path,
    config: &CliConfig,
) -> Result<StatusReport, CliError> {
    let snapshot = app.state.snapshot();
    let connectivity = app.monitor.state();

    Ok(StatusReport {
        database: db_path.display().to_string(),
        online: connectivity.online,
        authenticated: connectivity.authenticated,
        user_id: connectivity.user_id,
        api_base_url: remote_credentials(config).map(|credentials| credentials.api_url),
        pending_sync_entries: app.state.pending_sync_count()?,
        notes: snapshot.notes.len(),
        todos: snapshot.todos.len(),
        conflicts_resolved: app.state.recent_conflicts(50)?.len(),
    })
}

fn run_status(as_json: bool, db_path: &Path, config: &CliConfig) -> Result<(), CliError> {
    let app = open_app(db_path, config)?;
    let report = build_status_report(&app, db_path, config)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Database: {}", report.database);
        println!("Online: {}", if report.online { "yes" } else { "no" });
        match (&report.user_id, &report.api_base_url) {
            (Some(user), Some(url)) => println!("Signed in: {user} via {url}"),
            _ => println!("Signed in: no"),
        }
        println!("Pending sync entries: {}", report.pending_sync_entries);
        println!("Notes: {}  Todos: {}", report.notes, report.todos);
        if report.conflicts_resolved > 0 {
            println!("Conflicts resolved recently: {}", report.conflicts_resolved);
        }
    }

    Ok(())
}

fn run_config_init(api_url: Option<String>, config: &CliConfig) -> Result<(), CliError> {
    let mut updated = config.clone();
    if let Some(api_url) = api_url {
        if !util::is_http_url(&api_url) {
            return Err(CliError::Config(format!("Invalid API URL: {api_url}")));
        }
        updated.api_base_url = Some(api_url);
    }

    let path = updated.save().map_err(CliError::Config)?;
    println!("{}", path.display());
    Ok(())
}

fn run_config_show(config: &CliConfig) -> Result<(), CliError> {
    let mut shown = config.clone();
    if shown.access_token.is_some() {
        shown.access_token = Some("<redacted>".to_string());
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

async fn run_login(
    user: String,
    token: String,
    api_url: Option<String>,
    db_path: &Path,
    config: &CliConfig,
) -> Result<(), CliError> {
    let user = util::normalize_text_option(Some(user))
        .ok_or_else(|| CliError::Config("User id cannot be empty".to_string()))?;
    let token = util::normalize_text_option(Some(token))
        .ok_or_else(|| CliError::Config("Access token cannot be empty".to_string()))?;

    let mut updated = config.clone();
    if let Some(api_url) = api_url {
        if !util::is_http_url(&api_url) {
            return Err(CliError::Config(format!("Invalid API URL: {api_url}")));
        }
        updated.api_base_url = Some(api_url);
    }
    if updated.api_base_url.is_none() && env::var("JOT_API_URL").is_err() {
        return Err(CliError::SyncNotConfigured);
    }

    updated.user_id = Some(user.clone());
    updated.access_token = Some(token);
    updated.offline = false;
    updated.save().map_err(CliError::Config)?;
    println!("Signed in as {user}");

    // Replay anything queued while signed out
    let app = open_app(db_path, &updated)?;
    maybe_sync(&app).await;
    Ok(())
}

fn run_logout(config: &CliConfig) -> Result<(), CliError> {
    let mut updated = config.clone();
    updated.user_id = None;
    updated.access_token = None;
    updated.save().map_err(CliError::Config)?;

    // Queued changes stay in the database and replay on the next login
    println!("Signed out");
    Ok(())
}

async fn run_online(db_path: &Path, config: &CliConfig) -> Result<(), CliError> {
    let mut updated = config.clone();
    updated.offline = false;
    updated.save().map_err(CliError::Config)?;

    let app = open_app(db_path, &updated)?;
    let pending = app.state.pending_sync_count()?;
    if pending > 0 {
        println!("Online; replaying {pending} queued changes");
    } else {
        println!("Online");
    }
    maybe_sync(&app).await;
    Ok(())
}

fn run_offline(config: &CliConfig) -> Result<(), CliError> {
    let mut updated = config.clone();
    updated.offline = true;
    updated.save().map_err(CliError::Config)?;
    println!("Offline; changes will queue until `jot online`");
    Ok(())
}

fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();
    let mut buffer = Vec::new();

    match shell {
        CompletionShell::Bash => generate_for_shell(shells::Bash, &mut command, &mut buffer),
        CompletionShell::Zsh => generate_for_shell(shells::Zsh, &mut command, &mut buffer),
        CompletionShell::Fish => generate_for_shell(shells::Fish, &mut command, &mut buffer),
    }

    if let Some(path) = output_path {
        std::fs::write(path, &buffer)?;
        println!("{}", path.display());
    } else {
        io::stdout().write_all(&buffer)?;
    }

    Ok(())
}

fn generate_for_shell<G: Generator>(
    generator: G,
    command: &mut clap::Command,
    buffer: &mut Vec<u8>,
) {
    generate(generator, command, "jot", buffer);
}

fn note_entities(snapshot: &Snapshot) -> Vec<Entity> {
    snapshot.notes.iter().cloned().map(Entity::Note).collect()
}

fn todo_entities(snapshot: &Snapshot) -> Vec<Entity> {
    snapshot.todos.iter().cloned().map(Entity::Todo).collect()
}

fn all_entities(snapshot: &Snapshot) -> Vec<Entity> {
    let mut entities = note_entities(snapshot);
    entities.extend(todo_entities(snapshot));
    entities
}

/// Resolve an exact ID or a unique ID prefix among the given candidates.
///
/// Ambiguity reports full IDs: UUID v7 prefixes share their leading
/// timestamp characters, so a truncated listing could show identical
/// strings for distinct records.
fn resolve_entity(candidates: &[Entity], query: &str) -> Result<Entity, CliError> {
    if let Ok(id) = query.parse::<EntityId>() {
        if let Some(entity) = candidates.iter().find(|entity| entity.id() == id) {
            return Ok(entity.clone());
        }
    }

    let matches: Vec<&Entity> = candidates
        .iter()
        .filter(|entity| entity.id().as_str().starts_with(query))
        .collect();

    if matches.len() > 1 {
        let options = matches
            .iter()
            .take(3)
            .map(|entity| entity.id().as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(CliError::AmbiguousId(format!(
            "ID prefix '{query}' is ambiguous; matches: {options}"
        )));
    }

    matches
        .first()
        .map(|entity| (*entity).clone())
        .ok_or_else(|| CliError::RecordNotFound(query.to_string()))
}

fn resolve_note(snapshot: &Snapshot, query: &str) -> Result<Note, CliError> {
    resolve_entity(&note_entities(snapshot), query)?
        .into_note()
        .ok_or_else(|| CliError::RecordNotFound(query.to_string()))
}

fn resolve_todo(snapshot: &Snapshot, query: &str) -> Result<Todo, CliError> {
    resolve_entity(&todo_entities(snapshot), query)?
        .into_todo()
        .ok_or_else(|| CliError::RecordNotFound(query.to_string()))
}

fn resolve_item(todo: &Todo, query: &str) -> Result<TodoItem, CliError> {
    if let Ok(id) = query.parse::<EntityId>() {
        if let Some(item) = todo.items.iter().find(|item| item.id == id) {
            return Ok(item.clone());
        }
    }

    let matches: Vec<&TodoItem> = todo
        .items
        .iter()
        .filter(|item| item.id.as_str().starts_with(query))
        .collect();

    if matches.len() > 1 {
        let options = matches
            .iter()
            .take(3)
            .map(|item| item.id.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(CliError::AmbiguousId(format!(
            "Item ID prefix '{query}' is ambiguous; matches: {options}"
        )));
    }

    matches
        .first()
        .map(|item| (*item).clone())
        .ok_or_else(|| CliError::ItemNotFound(query.to_string()))
}

fn format_note_lines(notes: &[Note]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    notes
        .iter()
        .map(|note| {
            let id = note.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let title = clip(&note.title, 24);
            let preview = clip(&note.content, 32);
            let relative_time = format_relative_time(note.updated_at, now_ms);

            if preview.is_empty() {
                format!("{short_id:<13}  {title:<24}  {relative_time}")
            } else {
                format!("{short_id:<13}  {title:<24}  {preview:<32}  {relative_time}")
            }
        })
        .collect()
}

fn format_todo_lines(todos: &[Todo]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    let mut lines = Vec::new();

    for todo in todos {
        let id = todo.id.to_string();
        let short_id = id.chars().take(13).collect::<String>();
        let title = clip(&todo.title, 24);
        let counts = format!("[{}/{}]", todo.completed_count, todo.total_count);
        let relative_time = format_relative_time(todo.updated_at, now_ms);
        lines.push(format!(
            "{short_id:<13}  {title:<24}  {counts:<7}  {relative_time}"
        ));

        for item in &todo.items {
            let item_id = item.id.to_string();
            let item_short = item_id.chars().take(13).collect::<String>();
            let marker = if item.completed { "[x]" } else { "[ ]" };
            lines.push(format!(
                "    {item_short:<13}  {marker} {}",
                clip(&item.text, 48)
            ));
        }
    }

    lines
}

fn note_to_list_item(note: &Note, now_ms: i64) -> NoteListItem {
    NoteListItem {
        id: note.id.to_string(),
        title: note.title.clone(),
        preview: clip(&note.content, 80),
        color: note.color.clone(),
        created_at: note.created_at,
        updated_at: note.updated_at,
        relative_time: format_relative_time(note.updated_at, now_ms),
    }
}

fn todo_to_list_item(todo: &Todo, now_ms: i64) -> TodoListItem {
    TodoListItem {
        id: todo.id.to_string(),
        title: todo.title.clone(),
        color: todo.color.clone(),
        completed_count: todo.completed_count,
        total_count: todo.total_count,
        created_at: todo.created_at,
        updated_at: todo.updated_at,
        relative_time: format_relative_time(todo.updated_at, now_ms),
        items: todo
            .items
            .iter()
            .map(|item| TodoItemView {
                id: item.id.to_string(),
                text: item.text.clone(),
                completed: item.completed,
            })
            .collect(),
    }
}

/// First line of `text`, whitespace collapsed, truncated to `max_chars`
fn clip(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

struct NoteSeed {
    title: String,
    content: String,
}

/// Build a note from command arguments, piped stdin or an editor session,
/// in that order of preference
fn resolve_note_seed(
    title_parts: &[String],
    content_flag: Option<String>,
) -> Result<NoteSeed, CliError> {
    let joined = title_parts.join(" ");
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        return Ok(NoteSeed {
            title: trimmed.to_string(),
            content: content_flag.unwrap_or_default(),
        });
    }

    let captured = match read_piped_stdin()? {
        Some(text) => Some(text),
        None => capture_editor_input()?,
    };

    captured
        .and_then(|text| seed_from_text(&text, content_flag))
        .ok_or(CliError::EmptyTitle)
}

/// Split captured text into a title (first line) and body (the rest).
/// An explicit --content flag wins over the captured body.
fn seed_from_text(text: &str, content_flag: Option<String>) -> Option<NoteSeed> {
    let (first_line, rest) = text.split_once('\n').unwrap_or((text, ""));
    let title = first_line.trim();
    if title.is_empty() {
        return None;
    }

    Some(NoteSeed {
        title: title.to_string(),
        content: content_flag.unwrap_or_else(|| rest.trim().to_string()),
    })
}

fn normalize_title(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyTitle)
    } else {
        Ok(trimmed.to_string())
    }
}

fn normalize_item_text(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyItemText)
    } else {
        Ok(trimmed.to_string())
    }
}

fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(util::normalize_text_option(Some(buffer)))
}

fn capture_editor_input() -> Result<Option<String>, CliError> {
    capture_editor_input_with_initial("")
}

fn capture_editor_input_with_initial(initial_content: &str) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_note_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let note_content = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(util::normalize_text_option(Some(note_content)))
}

fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Fallback for editor commands with args, e.g. "code --wait"
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_note_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("jot-note-{}-{now}.txt", std::process::id()))
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("JOT_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jot")
        .join("jot.db")
}
