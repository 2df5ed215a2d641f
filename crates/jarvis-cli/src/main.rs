//! Operator command-line client for the JARVIS daemon.
//!
//! Thin by design: every subcommand is a direct HTTP or WebSocket call
//! against the daemon's external surface, with no business logic
//! duplicated from `jarvis-core` — the CLI crate never links the core
//! engine, only its own small set of transport dependencies.

use std::io::Write;

use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "jarvis", about = "Operator CLI for the JARVIS daemon")]
struct Cli {
    /// Base HTTP URL of the daemon, e.g. http://127.0.0.1:8080
    #[arg(long, env = "JARVIS_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Bearer token; obtained via `jarvis auth login` if omitted.
    #[arg(long, env = "JARVIS_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check daemon health.
    Health,
    /// Authenticate with the daemon's shared password.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Inspect the tool catalog.
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },
    /// Send one chat turn and stream the response.
    Chat {
        message: String,
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Exchange a password for a bearer token.
    Login {
        #[arg(long, env = "JARVIS_PASSWORD")]
        password: String,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List registered tools with their tiers.
    List,
}

fn require_token(token: &Option<String>) -> Result<String, String> {
    token
        .clone()
        .ok_or_else(|| "no token provided; run `jarvis auth login` or set JARVIS_TOKEN".to_owned())
}

async fn cmd_health(url: &str) -> Result<(), String> {
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{url}/api/health"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    let status = resp.status();
    let body: Value = resp.json().await.map_err(|e| format!("invalid response: {e}"))?;
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("daemon reported unhealthy status {status}"))
    }
}

async fn cmd_login(url: &str, password: &str) -> Result<(), String> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{url}/api/auth/login"))
        .json(&json!({"password": password}))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if !resp.status().is_success() {
        return Err(format!("login rejected: status {}", resp.status()));
    }

    let body: Value = resp.json().await.map_err(|e| format!("invalid response: {e}"))?;
    let token = body["token"].as_str().ok_or("login response missing token")?;
    println!("{token}");
    Ok(())
}

async fn cmd_tools_list(url: &str, token: &str) -> Result<(), String> {
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{url}/api/tools"))
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if !resp.status().is_success() {
        return Err(format!("request failed: status {}", resp.status()));
    }

    let body: Value = resp.json().await.map_err(|e| format!("invalid response: {e}"))?;
    let tools = body["tools"].as_array().cloned().unwrap_or_default();
    for tool in tools {
        println!(
            "{:<24} {:<8} {}",
            tool["name"].as_str().unwrap_or(""),
            tool["tier"].as_str().unwrap_or(""),
            tool["description"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}

/// Opens one WebSocket connection, sends a single `chat:send`, and prints
/// streamed `chat:token` text until `chat:done` or `chat:error` arrives.
/// Does not implement `chat:confirm` — a RED/ORANGE call surfaces the
/// `chat:confirm_needed` frame as plain text and the connection is closed,
/// since a one-shot CLI invocation has no notion of a resumable session.
async fn cmd_chat(url: &str, token: &str, message: &str, session: Option<String>) -> Result<(), String> {
    let ws_url = format!(
        "{}/api/v1/ws?token={token}",
        url.replacen("http://", "ws://", 1).replacen("https://", "wss://", 1)
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(|e| format!("failed to connect: {e}"))?;

    let request = json!({
        "type": "chat:send",
        "sessionId": session,
        "message": message,
    });
    socket
        .send(Message::Text(request.to_string().into()))
        .await
        .map_err(|e| format!("failed to send: {e}"))?;

    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| format!("websocket error: {e}"))?;
        let Message::Text(text) = msg else { continue };
        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };
        match frame["type"].as_str() {
            Some("chat:token") => {
                print!("{}", frame["text"].as_str().unwrap_or(""));
                let _ = std::io::stdout().flush();
            }
            Some("chat:tool_use") => {
                println!("\n[tool] {} {}", frame["name"].as_str().unwrap_or(""), frame["args"]);
            }
            Some("chat:confirm_needed") => {
                println!(
                    "\n[confirmation required] {} ({}) — not answerable from a one-shot CLI call",
                    frame["name"].as_str().unwrap_or(""),
                    frame["tier"].as_str().unwrap_or(""),
                );
                return Ok(());
            }
            Some("chat:error") => {
                return Err(frame["error"].as_str().unwrap_or("unknown error").to_owned());
            }
            Some("chat:done") => {
                println!();
                return Ok(());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Health => cmd_health(&cli.url).await,
        Command::Auth { action: AuthAction::Login { password } } => cmd_login(&cli.url, &password).await,
        Command::Tools { action: ToolsAction::List } => cmd_tools_list(&cli.url, &require_token(&cli.token)?).await,
        Command::Chat { message, session } => {
            cmd_chat(&cli.url, &require_token(&cli.token)?, &message, session).await
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    if let Err(e) = rt.block_on(dispatch(cli)) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
