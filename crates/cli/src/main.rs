mod config;
mod error;

use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use runtime::{
    Agent, AnthropicProvider, EmptyRegistry, Message, RuntimeEvent, SqliteStore, ToolAllowList,
    ToolStatus, decode_messages, repair,
};
use storage::{Event, EventKind, EventStore, SessionId};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

const SYSTEM_PROMPT: &str = "You are Capstan, a helpful AI assistant. Be concise and direct.";
const CONFIG_FILE: &str = "capstan.toml";
const LOG_ENV: &str = "CAPSTAN_LOG";
const PREVIEW_CHARS: usize = 200;
// 128 + SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "capstan")]
#[command(about = "A tool-calling agent runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Resume an existing session (prefix match supported)
        #[arg(short, long)]
        resume: Option<String>,
    },
    /// List all sessions
    Sessions {
        /// Show only the last N sessions
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show event logs for a session
    Logs {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
        /// Filter by event kind (session_start, message, session_end)
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Check a session's history and report what repair would change
    Repair {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
    },
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat { resume }) => cmd_chat(&cli.config, resume.as_deref()).await,
        None => cmd_chat(&cli.config, None).await,
        Some(Commands::Sessions { limit }) => cmd_sessions(limit),
        Some(Commands::Logs { session, kind }) => cmd_logs(&session, kind.as_deref()),
        Some(Commands::Repair { session }) => cmd_repair(&cli.config, &session),
    }
}

async fn cmd_chat(config_path: &Path, resume: Option<&str>) -> Result<()> {
    println!("capstan v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(config_path)?;
    let api_key = config.api_key()?;
    let model = config.backend.model.clone();

    let mut builder = AnthropicProvider::builder(api_key, &model);
    if let Some(url) = &config.backend.base_url {
        builder = builder.base_url(url);
    }
    if let Some(max_tokens) = config.backend.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    let provider = builder.build();

    let data_dir = dirs_data_dir().unwrap_or_else(|| ".capstan".into());
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("events.db");
    let store = EventStore::open(&db_path)?;
    println!("Session stored at: {}", db_path.display());

    let session_id = match resume {
        Some(prefix) => resolve_session(&store, prefix)?,
        None => SessionId::new(),
    };

    if config.runtime.system_prompt.is_none() {
        config.runtime.system_prompt = Some(SYSTEM_PROMPT.to_string());
    }
    let agent = Agent::builder(provider, EmptyRegistry, SqliteStore::new(store))
        .policy(config.policy)
        .config(config.runtime)
        .build()?;

    info!(session = %session_id, model = %model, resumed = resume.is_some(), "chat started");
    println!("Session ID: {session_id}");
    println!("Model: {model}");
    println!("Type 'quit' or Ctrl+D to exit.");
    println!("Ctrl+C cancels a running reply; press it again to quit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        let cancel = CancellationToken::new();
        let mut events = agent.process_stream(input, session_id, Some(cancel.clone()));
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => render_event(&event)?,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => match on_interrupt(cancel.is_cancelled()) {
                    Interrupt::Cancel => {
                        eprintln!("\n[cancelling; press Ctrl+C again to quit]");
                        cancel.cancel();
                    }
                    Interrupt::Exit => {
                        eprintln!("\nInterrupted.");
                        std::process::exit(INTERRUPTED_EXIT_CODE);
                    }
                },
            }
        }
    }

    agent.end_session(session_id).await?;
    println!("\nSession ended.");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    Exit,
}

/// The first Ctrl+C cancels the running reply; another one while it winds down quits.
fn on_interrupt(already_cancelled: bool) -> Interrupt {
    if already_cancelled {
        Interrupt::Exit
    } else {
        Interrupt::Cancel
    }
}

fn render_event(event: &RuntimeEvent) -> Result<()> {
    let mut stdout = io::stdout();
    match event {
        RuntimeEvent::Text(text) => {
            print!("{text}");
            stdout.flush()?;
        }
        RuntimeEvent::ToolCall(call) => {
            eprintln!("\n[tool] {} {}", call.name, preview(&call.raw));
        }
        RuntimeEvent::ToolResult(result) => {
            let status = match result.status {
                ToolStatus::Ok => "ok",
                ToolStatus::Error => "error",
            };
            eprintln!("[tool {status}] {}", preview(&result.content));
        }
        RuntimeEvent::Status(status) => eprintln!("\n[{status}]"),
        RuntimeEvent::Error(e) => eprintln!("\nError: {e}\n"),
        RuntimeEvent::Complete { .. } => println!("\n"),
    }
    Ok(())
}

fn cmd_sessions(limit: usize) -> Result<()> {
    let store = open_store()?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<8}  STATUS",
        "SESSION ID", "STARTED", "MSGS"
    );
    println!("{}", "-".repeat(80));

    for summary in sessions.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&summary.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let status = if summary.ended_at.is_some() {
            "ended"
        } else {
            "active"
        };
        println!(
            "{:<36}  {:<20}  {:<8}  {status}",
            summary.id, started, summary.message_count
        );
    }

    Ok(())
}

fn cmd_logs(session_prefix: &str, kind_filter: Option<&str>) -> Result<()> {
    let store = open_store()?;
    let session_id = resolve_session(&store, session_prefix)?;

    let events = store.load_events(session_id, kind_filter)?;

    if events.is_empty() {
        println!("No events found for session {session_id}");
        return Ok(());
    }

    println!("Session: {session_id}\n");

    for event in events {
        print_event(&event);
    }

    Ok(())
}

fn cmd_repair(config_path: &Path, session_prefix: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store()?;
    let session_id = resolve_session(&store, session_prefix)?;

    let messages = decode_messages(store.load_messages(session_id)?);
    // No registry is attached here; tools named in the history stand in for it.
    let named: BTreeSet<&str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.name.as_str()))
        .collect();
    let allow = ToolAllowList::new(named.into_iter().filter(|name| config.policy.allows(name)));

    let total = messages.len();
    let (repaired, report) = repair(messages, &allow);

    println!("Session: {session_id}");
    println!("Messages: {total} stored, {} after repair", repaired.len());
    if report.is_clean() {
        println!("History is consistent; nothing to repair.");
        return Ok(());
    }
    for call in &report.dropped_calls {
        println!("  dropped call:       {call}");
    }
    for id in &report.dropped_results {
        println!("  dropped result:     {id}");
    }
    for id in &report.synthesized {
        println!("  synthesized result: {id}");
    }
    if report.dropped_messages > 0 {
        println!("  dropped messages:   {}", report.dropped_messages);
    }
    println!("\nNothing was written; repair is applied when the session is next loaded.");
    Ok(())
}

fn print_event(event: &Event) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");

    match &event.kind {
        EventKind::SessionStart => {
            println!("[{time}] === Session started ===");
        }
        EventKind::SessionEnd => {
            println!("[{time}] === Session ended ===");
        }
        EventKind::Message { role, message } => {
            let label = role.as_str().to_uppercase();
            match serde_json::from_value::<Message>(message.clone()) {
                Ok(msg) => print_message(&time.to_string(), &label, &msg),
                Err(_) => println!("[{time}] {label}: <undecodable message>"),
            }
        }
    }
}

fn print_message(time: &str, label: &str, msg: &Message) {
    if let Some(result) = &msg.tool_result {
        let status = if result.is_error() { "error" } else { "ok" };
        println!(
            "[{time}] TOOL RESULT ({}, {status}): {}",
            result.call_id,
            preview(&result.content)
        );
        return;
    }
    if !msg.content.is_empty() {
        println!("[{time}] {label}: {}", preview(&msg.content));
    }
    for call in &msg.tool_calls {
        println!(
            "[{time}] TOOL CALL ({}): {} {}",
            call.id,
            call.name,
            preview(&call.raw)
        );
    }
    if let Some(stop) = msg.stop.as_ref().filter(|s| s.is_interrupted()) {
        println!("[{time}] (turn {stop})");
    }
}

// Truncate long text for display.
fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

fn resolve_session(store: &EventStore, prefix: &str) -> Result<SessionId> {
    let matching = store.find_session(prefix)?;
    match matching.as_slice() {
        [] => Err(Error::SessionNotFound {
            prefix: prefix.to_string(),
        }),
        [id] => Ok(*id),
        _ => Err(Error::AmbiguousSession {
            prefix: prefix.to_string(),
            matches: matching.iter().map(ToString::to_string).collect(),
        }),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Ok(Config::load(path)?)
    } else {
        Ok(Config::default_config())
    }
}

fn open_store() -> Result<EventStore> {
    let data_dir = dirs_data_dir().unwrap_or_else(|| ".capstan".into());
    let db_path = data_dir.join("events.db");

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(EventStore::open(&db_path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/capstan"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("capstan"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("capstan"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_interrupt_exits() {
        let cancel = CancellationToken::new();
        assert_eq!(on_interrupt(cancel.is_cancelled()), Interrupt::Cancel);
        cancel.cancel();
        assert_eq!(on_interrupt(cancel.is_cancelled()), Interrupt::Exit);
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "x".repeat(PREVIEW_CHARS + 10);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview("short"), "short");
    }
}
