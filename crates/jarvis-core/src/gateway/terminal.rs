//! Terminal channel (`terminal` events) for the real-time multiplexer.
//!
//! One PTY per connection. `start` resolves a node name to a host
//! (case-insensitive, via `resolve_host`), opens a PTY over the pooled
//! SSH connection, and spawns a background reader that pipes `data` frames
//! back to the client until the shell exits, the client calls `stop`, or
//! the socket disconnects. PTY reads/writes are blocking `ssh2` calls and
//! always run on `spawn_blocking`, matching `exec_with_timeout`'s idiom.
//!
//! `data` payloads are hex-encoded in both directions: a PTY stream carries
//! raw bytes (control sequences, multi-byte UTF-8, resize acks), not
//! necessarily valid text, so this reuses the hex convention `chat.rs`
//! already established for binary audio frames rather than assuming UTF-8.

use std::{sync::Arc, time::Duration};

use serde_json::json;

use crate::infra::PtyHandle;

use super::ws::{send_json, Connection};

/// How often the background reader polls the PTY for output between
/// blocking reads returning empty.
const POLL_INTERVAL: Duration = Duration::from_millis(30);

pub async fn start(conn: &Arc<Connection>, node: &str) {
    let host = match conn.state.proxmox.resolve_host(node) {
        Ok(host) => host,
        Err(e) => {
            send_json(&conn.out, json!({"type": "error", "error": e.to_string()})).await;
            return;
        }
    };

    // Starting a new session on this socket replaces any prior one.
    conn.terminal.lock().await.take();

    let ssh = conn.state.ssh.clone();
    let host_for_open = host.clone();
    let opened = tokio::task::spawn_blocking(move || ssh.open_shell_blocking(&host_for_open, 80, 24)).await;

    let pty = match opened {
        Ok(Ok(pty)) => Arc::new(pty),
        Ok(Err(e)) => {
            send_json(&conn.out, json!({"type": "error", "error": e.to_string()})).await;
            return;
        }
        Err(join_err) => {
            send_json(
                &conn.out,
                json!({"type": "error", "error": format!("pty open task panicked: {join_err}")}),
            )
            .await;
            return;
        }
    };

    *conn.terminal.lock().await = Some(pty.clone());
    send_json(&conn.out, json!({"type": "ready", "node": node, "host": host})).await;

    tokio::spawn(read_loop(conn.clone(), pty));
}

pub async fn data(conn: &Arc<Connection>, data: &str) {
    let Some(pty) = conn.terminal.lock().await.clone() else {
        return;
    };
    let Ok(bytes) = hex::decode(data) else {
        send_json(&conn.out, json!({"type": "error", "error": "invalid hex payload"})).await;
        return;
    };
    let result = tokio::task::spawn_blocking(move || pty.write(&bytes)).await;
    if let Ok(Err(e)) = result {
        send_json(&conn.out, json!({"type": "error", "error": e.to_string()})).await;
    }
}

pub async fn resize(conn: &Arc<Connection>, cols: u32, rows: u32) {
    let Some(pty) = conn.terminal.lock().await.clone() else {
        return;
    };
    let result = tokio::task::spawn_blocking(move || pty.resize(cols, rows)).await;
    if let Ok(Err(e)) = result {
        send_json(&conn.out, json!({"type": "error", "error": e.to_string()})).await;
    }
}

/// Explicit `stop`: closes the PTY without disposing the pooled SSH
/// connection underneath it. The background reader notices the slot is
/// empty on its next poll and exits silently — no `exit` frame, since this
/// closure was requested, not reported by the remote shell.
pub async fn stop(conn: &Arc<Connection>) {
    conn.terminal.lock().await.take();
}

pub async fn on_disconnect(conn: &Arc<Connection>) {
    conn.terminal.lock().await.take();
}

/// Background task owning the read side of one PTY. Exits as soon as the
/// connection's terminal slot no longer holds this exact handle — either
/// because `stop`/disconnect cleared it or because `start` replaced it with
/// a new session.
async fn read_loop(conn: Arc<Connection>, pty: Arc<PtyHandle>) {
    loop {
        {
            let guard = conn.terminal.lock().await;
            match &*guard {
                Some(current) if Arc::ptr_eq(current, &pty) => {}
                _ => return,
            }
        }

        let reader = pty.clone();
        let read = tokio::task::spawn_blocking(move || reader.read_available()).await;

        match read {
            Ok(Ok(bytes)) if !bytes.is_empty() => {
                send_json(&conn.out, json!({"type": "data", "data": hex::encode(&bytes)})).await;
            }
            Ok(Ok(_)) => {
                let checker = pty.clone();
                let eof = tokio::task::spawn_blocking(move || checker.is_eof()).await.unwrap_or(true);
                if eof {
                    let mut guard = conn.terminal.lock().await;
                    if matches!(&*guard, Some(current) if Arc::ptr_eq(current, &pty)) {
                        *guard = None;
                        drop(guard);
                        send_json(&conn.out, json!({"type": "exit"})).await;
                    }
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok(Err(e)) => {
                let mut guard = conn.terminal.lock().await;
                if matches!(&*guard, Some(current) if Arc::ptr_eq(current, &pty)) {
                    *guard = None;
                    drop(guard);
                    send_json(&conn.out, json!({"type": "error", "error": e.to_string()})).await;
                }
                return;
            }
            Err(join_err) => {
                tracing::warn!("terminal read task panicked: {join_err}");
                return;
            }
        }
    }
}
