//! Container restart path for the TTS health probe: a thin client for the
//! Docker-compatible control socket bind-mounted into the
//! daemon's container, following the same "blocking I/O on `spawn_blocking`"
//! shape as `ssh.rs` since a Unix domain socket has no async-native client
//! in this dependency stack.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    time::Duration,
};

use async_trait::async_trait;

use crate::tts::RestartController;

pub struct ContainerRestartController {
    socket_path: String,
}

impl ContainerRestartController {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    fn restart_blocking(socket_path: &str, container: &str) -> Result<(), String> {
        let mut stream = UnixStream::connect(socket_path)
            .map_err(|e| format!("failed to connect to container control socket: {e}"))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .map_err(|e| format!("failed to set socket timeout: {e}"))?;

        let request = format!(
            "POST /containers/{container}/restart?t=5 HTTP/1.0\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n"
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| format!("failed to write restart request: {e}"))?;

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .map_err(|e| format!("failed to read restart response: {e}"))?;

        let status_line = response.lines().next().unwrap_or("");
        if status_line.contains(" 204") || status_line.contains(" 200") {
            Ok(())
        } else {
            Err(format!("container control socket rejected restart: {status_line}"))
        }
    }
}

#[async_trait]
impl RestartController for ContainerRestartController {
    async fn restart(&self, engine: &str) -> Result<(), String> {
        let socket_path = self.socket_path.clone();
        let engine = engine.to_owned();
        tokio::task::spawn_blocking(move || Self::restart_blocking(&socket_path, &engine))
            .await
            .map_err(|e| format!("restart task panicked: {e}"))?
    }
}
