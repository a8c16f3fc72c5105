use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use panelforge_contracts::{
    ApiFormat, GalleryLocation, GalleryReference, Journal, LibraryIndex, NotificationRecord,
    OpenAiTransport, ProcessingMode, Settings, SettingsStore,
};
use panelforge_engine::{
    open_source, AiClientFactory, CoordinatorContext, JournalNotifier, TaskCoordinator,
    TaskOutcome,
};
use serde_json::json;

const HOME_ENV: &str = "PANELFORGE_HOME";
const DEFAULT_HOME: &str = ".panelforge";

#[derive(Debug, Parser)]
#[command(name = "panelforge", version, about = "Batch colorize and translate comic pages")]
struct Cli {
    /// State directory (settings, library index, notifications, outputs).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Library(LibraryCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Record a task as pending without running it.
    Enqueue(TaskArgs),
    /// Queue a task and run it now.
    Process(TaskArgs),
    /// Run every pending task.
    Resume,
    /// List a gallery's pages in processing order.
    Inspect(InspectArgs),
    /// Show the latest notification of each gallery.
    Notifications(NotificationsArgs),
}

#[derive(Debug, Subcommand)]
enum LibraryCommand {
    Add(LibraryAddArgs),
    List(LibraryListArgs),
}

#[derive(Debug, Parser)]
struct LibraryAddArgs {
    /// Folder of page images or a zip/cbz archive.
    path: PathBuf,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    id: Option<u64>,
    #[arg(long = "tag")]
    tags: Vec<String>,
}

#[derive(Debug, Parser)]
struct LibraryListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
}

#[derive(Debug, Parser)]
struct SettingsSetArgs {
    #[arg(long)]
    api_format: Option<ApiFormat>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    openai_transport: Option<OpenAiTransport>,
    #[arg(long)]
    request_delay_ms: Option<u64>,
    #[arg(long)]
    max_consecutive_failures: Option<u32>,
    #[arg(long)]
    request_timeout_secs: Option<u64>,
    #[arg(long)]
    output_root: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct TaskArgs {
    gallery_id: u64,
    /// None, Color, Translate or Full.
    mode: ProcessingMode,
}

#[derive(Debug, Parser)]
struct InspectArgs {
    gallery_id: Option<u64>,
    #[arg(long, conflicts_with = "gallery_id")]
    path: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct NotificationsArgs {
    /// Print every journal line instead of the latest per gallery.
    #[arg(long)]
    all: bool,
}

struct Home {
    root: PathBuf,
}

impl Home {
    fn resolve(flag: Option<PathBuf>) -> Self {
        let root = flag
            .or_else(|| env::var_os(HOME_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
        log::debug!("using home {}", root.display());
        Self { root }
    }

    fn settings(&self) -> SettingsStore {
        SettingsStore::new(self.root.join("settings.json"))
    }

    fn library(&self) -> LibraryIndex {
        LibraryIndex::new(self.root.join("library.json"))
    }

    fn journal(&self) -> Journal {
        Journal::new(self.root.join("notifications.jsonl"))
    }

    fn galleries(&self) -> PathBuf {
        self.root.join("galleries")
    }

    fn coordinator(&self) -> Result<TaskCoordinator> {
        TaskCoordinator::start(CoordinatorContext {
            settings: self.settings(),
            library: self.library(),
            notifier: Arc::new(JournalNotifier::new(self.journal())),
            factory: Arc::new(AiClientFactory),
            default_output_root: self.galleries(),
        })
    }
}

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("panelforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let home = Home::resolve(cli.home);
    match cli.command {
        Command::Library(LibraryCommand::Add(args)) => run_library_add(&home, args),
        Command::Library(LibraryCommand::List(args)) => run_library_list(&home, args),
        Command::Settings(SettingsCommand::Show) => run_settings_show(&home),
        Command::Settings(SettingsCommand::Set(args)) => run_settings_set(&home, args),
        Command::Enqueue(args) => run_enqueue(&home, args),
        Command::Process(args) => run_process(&home, args),
        Command::Resume => run_resume(&home),
        Command::Inspect(args) => run_inspect(&home, args),
        Command::Notifications(args) => run_notifications(&home, args),
    }
}

fn run_library_add(home: &Home, args: LibraryAddArgs) -> Result<i32> {
    let path = args
        .path
        .canonicalize()
        .with_context(|| format!("gallery path {} not found", args.path.display()))?;
    let location = GalleryLocation::detect(&path);
    let page_count = open_source(&location)?.len();
    if page_count == 0 {
        bail!("no pages (jpg, jpeg, png, webp) found in {}", path.display());
    }

    let library = home.library();
    let existing = library.list()?;
    let id = match args.id {
        Some(id) if existing.iter().any(|gallery| gallery.id == id) => {
            bail!("gallery id {id} is already taken")
        }
        Some(id) => id,
        None => next_gallery_id(&existing),
    };
    let title = args.title.unwrap_or_else(|| default_title(&path));
    let mut gallery = GalleryReference::new(id, title, location);
    gallery.tags = args.tags;
    gallery.page_count = page_count;
    let gallery = library.upsert(gallery)?;
    println!("added gallery {} \"{}\" ({} pages)", gallery.id, gallery.title, page_count);
    Ok(0)
}

/// Next multiple of ten above every known id; derived outputs use `id * 10 + 1..=3`, so these
/// never collide with them.
fn next_gallery_id(existing: &[GalleryReference]) -> u64 {
    let max = existing.iter().map(|gallery| gallery.id).max().unwrap_or(0);
    (max / 10 + 1).saturating_mul(10)
}

fn default_title(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "untitled".to_string())
}

fn run_library_list(home: &Home, args: LibraryListArgs) -> Result<i32> {
    let galleries = home.library().list()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&galleries)?);
        return Ok(0);
    }
    if galleries.is_empty() {
        println!("library is empty");
    }
    for gallery in galleries {
        let origin = gallery
            .derived_from
            .as_ref()
            .map(|derived| format!(" <- {} ({})", derived.source_id, derived.stage.label()))
            .unwrap_or_default();
        println!(
            "{:>8}  {:>4}p  {}{}",
            gallery.id, gallery.page_count, gallery.title, origin
        );
    }
    Ok(0)
}

fn run_settings_show(home: &Home) -> Result<i32> {
    let settings = home.settings().load()?;
    let config = settings.provider_config();
    let view = json!({
        "path": home.settings().path().to_string_lossy(),
        "api_format": config.format.name(),
        "api_base": config.base_url,
        "api_key": config.api_key.as_deref().map(mask_secret),
        "model": config.model,
        "openai_transport": config.openai_transport,
        "request_delay_ms": settings.request_delay_ms,
        "max_consecutive_failures": settings.max_consecutive_failures,
        "request_timeout_secs": settings.request_timeout_secs,
        "output_root": settings
            .output_root
            .clone()
            .unwrap_or_else(|| home.galleries())
            .to_string_lossy(),
        "pending_tasks": settings.pending_tasks,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(0)
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.trim().chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

fn run_settings_set(home: &Home, args: SettingsSetArgs) -> Result<i32> {
    let updated = home.settings().update(|settings| apply_settings(settings, args))?;
    println!(
        "saved settings ({} via {})",
        updated.provider_config().model,
        updated.api_format
    );
    Ok(0)
}

fn apply_settings(settings: &mut Settings, args: SettingsSetArgs) {
    if let Some(format) = args.api_format {
        settings.api_format = format;
    }
    if let Some(base) = args.api_base {
        settings.api_base = optional_text(base);
    }
    if let Some(key) = args.api_key {
        settings.api_key = optional_text(key);
    }
    if let Some(model) = args.model {
        settings.model = optional_text(model);
    }
    if let Some(transport) = args.openai_transport {
        settings.openai_transport = Some(transport);
    }
    if let Some(delay) = args.request_delay_ms {
        settings.request_delay_ms = delay;
    }
    if let Some(bound) = args.max_consecutive_failures {
        settings.max_consecutive_failures = bound;
    }
    if let Some(timeout) = args.request_timeout_secs {
        settings.request_timeout_secs = timeout;
    }
    if let Some(root) = args.output_root {
        settings.output_root = Some(root);
    }
}

/// An empty value clears the field back to its default.
fn optional_text(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn load_gallery(home: &Home, id: u64) -> Result<GalleryReference> {
    home.library()
        .get(id)?
        .with_context(|| format!("gallery {id} is not in the library"))
}

fn run_enqueue(home: &Home, args: TaskArgs) -> Result<i32> {
    let gallery = load_gallery(home, args.gallery_id)?;
    let coordinator = home.coordinator()?;
    coordinator.enqueue(&gallery, args.mode)?;
    coordinator.finish();
    println!(
        "queued gallery {} for {}; run `panelforge resume` to process",
        gallery.id, args.mode
    );
    Ok(0)
}

fn run_process(home: &Home, args: TaskArgs) -> Result<i32> {
    let gallery = load_gallery(home, args.gallery_id)?;
    let coordinator = home.coordinator()?;
    coordinator.submit(gallery, args.mode)?;
    Ok(report_outcomes(&coordinator.finish()))
}

fn run_resume(home: &Home) -> Result<i32> {
    let coordinator = home.coordinator()?;
    let dispatched = coordinator.dispatch_pending()?;
    if dispatched == 0 {
        println!("no pending tasks");
    }
    Ok(report_outcomes(&coordinator.finish()))
}

fn report_outcomes(outcomes: &[TaskOutcome]) -> i32 {
    let mut code = 0;
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => {
                for stage in &report.stages {
                    let detail = if stage.skipped {
                        "already done".to_string()
                    } else {
                        format!(
                            "{} transformed, {} unchanged",
                            stage.transformed, stage.fillers
                        )
                    };
                    println!(
                        "gallery {} {}: {} -> {} ({detail})",
                        outcome.gallery_id,
                        stage.stage.label(),
                        stage.output.id,
                        stage.directory.display()
                    );
                }
            }
            Err(err) => {
                eprintln!("gallery {} {} failed: {err}", outcome.gallery_id, outcome.mode);
                code = 1;
            }
        }
    }
    code
}

fn run_inspect(home: &Home, args: InspectArgs) -> Result<i32> {
    let location = match (args.gallery_id, args.path) {
        (Some(id), _) => load_gallery(home, id)?.location,
        (None, Some(path)) => GalleryLocation::detect(path),
        (None, None) => bail!("pass a gallery id or --path"),
    };
    let source = open_source(&location)?;
    for index in 0..source.len() {
        println!("{index:>4}  {}", source.name(index).unwrap_or_default());
    }
    println!("{} pages", source.len());
    Ok(0)
}

fn run_notifications(home: &Home, args: NotificationsArgs) -> Result<i32> {
    let journal = home.journal();
    let records = if args.all {
        journal.read_all()?
    } else {
        journal.current()?
    };
    if records.is_empty() {
        println!("no notifications");
    }
    for record in &records {
        println!("{}", format_notification(record));
    }
    Ok(0)
}

fn format_notification(record: &NotificationRecord) -> String {
    let progress = record
        .progress
        .map(|progress| format!(" [{}/{}]", progress.done, progress.total))
        .unwrap_or_default();
    format!(
        "{}  {:<9} {}: {}{progress}",
        record.ts, record.kind, record.title, record.message
    )
}
