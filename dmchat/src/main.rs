//! Line-oriented direct-message client.
//!
//! Reads commands from stdin and prints the reconciled conversation to
//! stdout. Configuration via CLI flags, environment variables, or config
//! file (`~/.config/dmchat/config.toml`).
//!
//! ```bash
//! cargo run --bin dmchat -- --ws-host ws://127.0.0.1:9000 \
//!     --api-url http://127.0.0.1:9000 --user alice --conversation 1
//! ```
//!
//! Commands: `/open <id>`, `/more`, `/list`, `/reconnect`, `/quit`.
//! Any other line is sent to the active conversation.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use dmchat::api::HttpApi;
use dmchat::channel::ws::WsConnector;
use dmchat::config::{CliArgs, ClientConfig};
use dmchat::engine::ScrollIntent;
use dmchat::log::FileLog;
use dmchat::session::{SessionCommand, SessionEvent, SessionHandle, spawn_session};
use dmchat_proto::message::{ConversationId, Message, MessageId};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(ws_host = %config.ws_host, api_url = %config.api_url, "dmchat starting");

    let api = HttpApi::new(config.api_url.clone(), config.user.clone(), config.connect_timeout)
        .map_err(io::Error::other)?;
    let log = FileLog::open(config.log_dir.clone())
        .await
        .map_err(io::Error::other)?;
    let connector = WsConnector::new(
        config.ws_host.clone(),
        config.connect_timeout,
        config.channel_capacity,
    );

    let (handle, events, task) = spawn_session(
        connector,
        api.clone(),
        log,
        api,
        config.session_config(),
    );

    if let Some(conversation) = config.conversation.clone() {
        handle.open(conversation).await.map_err(io::Error::other)?;
    }

    let oldest = Arc::new(Mutex::new(None));
    let printer = tokio::spawn(print_events(events, Arc::clone(&oldest)));
    let result = read_commands(&handle, &oldest).await;

    let _ = handle.shutdown().await;
    let _ = task.await;
    let _ = printer.await;

    tracing::info!("dmchat exiting");
    result
}

/// Initialize file-based logging.
///
/// Logs are written to a file so they never interleave with the
/// conversation printed on stdout. Returns a [`WorkerGuard`] that must be
/// held until shutdown to ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("dmchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
enum InputLine {
    Open(ConversationId),
    More,
    List,
    Reconnect,
    Quit,
    Text(String),
    Unknown(String),
}

fn parse_line(line: &str) -> InputLine {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return InputLine::Text(line.to_string());
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();
    match command {
        "open" if !arg.is_empty() => InputLine::Open(ConversationId::new(arg)),
        "more" => InputLine::More,
        "list" => InputLine::List,
        "reconnect" => InputLine::Reconnect,
        "quit" | "exit" => InputLine::Quit,
        _ => InputLine::Unknown(trimmed.to_string()),
    }
}

/// Read stdin until EOF or `/quit`.
///
/// `/more` asks for the page before the oldest message shown, which is
/// what scrolling to the top would do in a graphical client.
async fn read_commands(
    handle: &SessionHandle,
    oldest: &Mutex<Option<MessageId>>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match parse_line(&line) {
            InputLine::Open(conversation) => handle.open(conversation).await,
            InputLine::More => match oldest.lock().clone() {
                Some(id) => handle.scroll_top(id).await,
                None => Ok(()),
            },
            InputLine::List => handle.send(SessionCommand::ListConversations).await,
            InputLine::Reconnect => handle.send(SessionCommand::Reconnect).await,
            InputLine::Quit => break,
            InputLine::Text(text) => handle.send_text(text).await,
            InputLine::Unknown(command) => {
                println!("unknown command: {command}");
                Ok(())
            }
        };
        if sent.is_err() {
            break;
        }
    }
    Ok(())
}

/// Print session events until the session ends.
async fn print_events(
    mut events: mpsc::Receiver<SessionEvent>,
    oldest: Arc<Mutex<Option<MessageId>>>,
) {
    let mut transcript = Transcript::default();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Messages(messages) => {
                oldest.lock().clone_from(&messages.first().and_then(|m| m.id.clone()));
                for line in transcript.new_lines(&messages) {
                    println!("{line}");
                }
            }
            SessionEvent::Scroll(ScrollIntent::Anchor(id)) => {
                println!("-- older messages loaded above {id} --");
            }
            SessionEvent::Scroll(ScrollIntent::Bottom) | SessionEvent::ComposerCleared => {}
            SessionEvent::Loading(true) => println!("loading..."),
            SessionEvent::Loading(false) => {}
            SessionEvent::InputRejected(e) => println!("not sent: {e}"),
            SessionEvent::Title(title) => println!("== {title} =="),
            SessionEvent::Identity(identity) => println!("logged in as {identity}"),
            SessionEvent::RedirectToLogin => println!("not logged in; set --user"),
            SessionEvent::ConnectionStatus {
                conversation,
                connected,
            } => {
                let state = if connected { "connected" } else { "disconnected" };
                println!("[{conversation}] {state}");
            }
            SessionEvent::SendAbandoned {
                content,
                attempts,
                reason,
                ..
            } => println!("failed after {attempts} attempts ({reason}): {content}"),
            SessionEvent::Conversations(list) => {
                for entry in list {
                    println!("  {}  {}", entry.id, entry.msg_title);
                }
            }
            SessionEvent::Warning(warning) => println!("warning: {warning}"),
        }
    }
}

/// Messages already printed for the conversation on screen.
#[derive(Default)]
struct Transcript {
    printed: HashSet<MessageId>,
}

impl Transcript {
    /// Lines for the messages in `messages` not printed yet.
    ///
    /// Opening a conversation publishes an empty list first, which starts a
    /// fresh transcript.
    fn new_lines(&mut self, messages: &[Message]) -> Vec<String> {
        if messages.is_empty() {
            self.printed.clear();
        }
        messages
            .iter()
            .filter(|m| m.id.as_ref().is_some_and(|id| self.printed.insert(id.clone())))
            .map(|m| format!("{}: {}", m.sender_username, m.content))
            .collect()
    }
}
