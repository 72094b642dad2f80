use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use compliancedesk::{
    EditConfig, FieldMap, InMemoryRecordStore, RecordKind, RecordService, SaveRequest,
    SessionContext, SystemLogger, diff, format_for_display,
};
use env_logger::Env;
use log::LevelFilter;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "compliancedesk")]
#[command(about = "Developer tooling for compliance record editing")]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the field changes between two JSON objects
    Diff {
        #[arg(long)]
        original: PathBuf,
        #[arg(long)]
        updated: PathBuf,
        #[arg(long, default_value = "None")]
        empty_marker: String,
    },
    /// Run an edit session against an in-memory store
    Demo {
        /// Edit session settings as a JSON file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(Env::default().default_filter_or("warn"));
    if cli.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    match cli.command {
        Command::Diff {
            original,
            updated,
            empty_marker,
        } => print_diff(&original, &updated, &empty_marker),
        Command::Demo { config } => {
            let config = match config {
                Some(path) => {
                    let raw = fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read '{}'", path.display()))?;
                    EditConfig::from_json(&raw).map_err(|e| anyhow!(e))?
                }
                None => EditConfig::default(),
            };
            run_demo(config).await
        }
    }
}

fn read_fields(path: &Path) -> Result<FieldMap> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("'{}' is not valid JSON", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("'{}' must contain a JSON object", path.display()),
    }
}

fn print_diff(original: &Path, updated: &Path, empty_marker: &str) -> Result<()> {
    let original = read_fields(original)?;
    let updated = read_fields(updated)?;

    let changes = diff(&original, &updated);
    if changes.is_empty() {
        println!("No changes");
        return Ok(());
    }
    for line in format_for_display(&changes, empty_marker) {
        println!("{line}");
    }
    Ok(())
}

async fn run_demo(config: EditConfig) -> Result<()> {
    let store = Arc::new(InMemoryRecordStore::new());
    let ctx = SessionContext::new("demo-user").with_email("demo@example.com");
    store
        .seed(
            "users",
            vec![
                json!({ "id": "demo-user", "full_name": "Demo User", "email": "demo@example.com" })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ],
        )
        .await;

    let logger = SystemLogger::new(store.clone());
    let service =
        RecordService::new(store.clone(), RecordKind::Asset).with_system_log(logger.clone());

    let mut fields = FieldMap::new();
    fields.insert("name".to_string(), json!("Acme"));
    fields.insert("status".to_string(), json!("Pending"));
    let created = service.create(&ctx, fields).await?;
    println!("Created asset {} ({})", created.id, created.name().unwrap_or(""));

    let mut session = compliancedesk::EditSession::new(
        store.clone(),
        RecordKind::Asset,
        ctx.clone(),
        config,
    )?
    .with_audit(service.audit().clone())
    .with_system_log(logger);

    session.load(&created.id).await?;
    let lock = session.enter_edit().await?;
    println!("Entered edit mode (lock: {lock:?})");

    session.mutate_field("status", json!("Active"))?;
    session.mutate_field("managing_office", json!("London"))?;

    match session.request_save().await? {
        SaveRequest::NoChanges => println!("Nothing to save"),
        SaveRequest::NeedsConfirmation { display, .. } => {
            println!("Pending changes:");
            for line in display {
                println!("  {line}");
            }
            let receipt = session.confirm_save("Quarterly review").await?;
            println!("Saved {} field(s)", receipt.changes.len());
        }
    }

    println!("History:");
    for view in session.history().await? {
        for line in view.entry.describe() {
            println!("  {} - {} ({})", view.entry.created_at, line, view.user_display);
        }
    }
    Ok(())
}
