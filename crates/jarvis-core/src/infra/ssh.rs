//! Pooled SSH connections: one persistent session per host, lazily created,
//! key-file authenticated. Commands and PTYs both race against an external
//! timer because `ssh2` has no native per-command timeout.

use std::{
    collections::HashMap,
    io::Read,
    sync::{Arc, Mutex},
    time::Duration,
};

use ssh2::Session;

use crate::error::{JarvisError, JarvisResult};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

/// A PTY handle returned by `open_shell`, used by the terminal multiplexer.
/// Reads and writes are blocking and must run on a `spawn_blocking` task.
pub struct PtyHandle {
    channel: Mutex<ssh2::Channel>,
}

impl PtyHandle {
    pub fn write(&self, data: &[u8]) -> JarvisResult<()> {
        use std::io::Write;
        let mut ch = self.channel.lock().expect("pty channel lock poisoned");
        ch.write_all(data)
            .map_err(|e| JarvisError::Internal(format!("pty write failed: {e}")))
    }

    pub fn read_available(&self) -> JarvisResult<Vec<u8>> {
        let mut ch = self.channel.lock().expect("pty channel lock poisoned");
        let mut buf = [0u8; 4096];
        match ch.read(&mut buf) {
            Ok(0) => Ok(Vec::new()),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(JarvisError::Internal(format!("pty read failed: {e}"))),
        }
    }

    pub fn resize(&self, cols: u32, rows: u32) -> JarvisResult<()> {
        let mut ch = self.channel.lock().expect("pty channel lock poisoned");
        ch.request_pty_size(cols, rows, None, None)
            .map_err(|e| JarvisError::Internal(format!("pty resize failed: {e}")))
    }

    pub fn is_eof(&self) -> bool {
        let ch = self.channel.lock().expect("pty channel lock poisoned");
        ch.eof()
    }
}

struct PooledConn {
    session: Session,
}

/// One persistent connection per host. Stale connections are disposed and
/// replaced on the next call rather than health-checked proactively.
pub struct SshPool {
    key_path: String,
    user: String,
    connect_timeout: Duration,
    conns: Mutex<HashMap<String, Arc<PooledConn>>>,
}

impl SshPool {
    pub fn new(key_path: impl Into<String>, user: impl Into<String>, connect_timeout_secs: u64) -> Self {
        Self {
            key_path: key_path.into(),
            user: user.into(),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            conns: Mutex::new(HashMap::new()),
        }
    }

    fn connect(&self, host: &str) -> JarvisResult<Arc<PooledConn>> {
        let tcp = std::net::TcpStream::connect((host, 22))
            .map_err(|e| JarvisError::Upstream {
                host: host.to_owned(),
                path: "tcp:22".to_owned(),
                detail: e.to_string(),
            })?;
        tcp.set_read_timeout(Some(self.connect_timeout)).ok();

        let mut session = Session::new()
            .map_err(|e| JarvisError::Internal(format!("ssh session init failed: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| JarvisError::Upstream {
                host: host.to_owned(),
                path: "handshake".to_owned(),
                detail: e.to_string(),
            })?;
        session
            .userauth_pubkey_file(&self.user, None, std::path::Path::new(&self.key_path), None)
            .map_err(|e| JarvisError::Upstream {
                host: host.to_owned(),
                path: "userauth".to_owned(),
                detail: e.to_string(),
            })?;

        let conn = Arc::new(PooledConn { session });
        self.conns
            .lock()
            .expect("ssh pool lock poisoned")
            .insert(host.to_owned(), conn.clone());
        Ok(conn)
    }

    fn get_or_connect(&self, host: &str) -> JarvisResult<Arc<PooledConn>> {
        if let Some(conn) = self.conns.lock().expect("ssh pool lock poisoned").get(host) {
            if conn.session.authenticated() {
                return Ok(conn.clone());
            }
        }
        self.connect(host)
    }

    fn evict(&self, host: &str) {
        self.conns.lock().expect("ssh pool lock poisoned").remove(host);
    }

    /// Run `cmd` on `host`, replacing the pooled connection on failure.
    /// Must be called from within `spawn_blocking` — all I/O here blocks.
    pub fn exec_blocking(&self, host: &str, cmd: &str) -> JarvisResult<ExecResult> {
        let conn = self.get_or_connect(host)?;
        let mut channel = conn.session.channel_session().map_err(|e| {
            self.evict(host);
            JarvisError::Upstream {
                host: host.to_owned(),
                path: "channel".to_owned(),
                detail: e.to_string(),
            }
        })?;

        channel.exec(cmd).map_err(|e| {
            self.evict(host);
            JarvisError::Upstream {
                host: host.to_owned(),
                path: cmd.to_owned(),
                detail: e.to_string(),
            }
        })?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        channel.read_to_string(&mut stdout).ok();
        channel.stderr().read_to_string(&mut stderr).ok();
        channel.wait_close().ok();
        let code = channel.exit_status().unwrap_or(-1);

        Ok(ExecResult { stdout, stderr, code })
    }

    pub fn open_shell_blocking(&self, host: &str, cols: u32, rows: u32) -> JarvisResult<PtyHandle> {
        let conn = self.get_or_connect(host)?;
        let mut channel = conn
            .session
            .channel_session()
            .map_err(|e| JarvisError::Upstream {
                host: host.to_owned(),
                path: "channel".to_owned(),
                detail: e.to_string(),
            })?;
        channel
            .request_pty("xterm", None, Some((cols, rows, 0, 0)))
            .map_err(|e| JarvisError::Upstream {
                host: host.to_owned(),
                path: "pty".to_owned(),
                detail: e.to_string(),
            })?;
        channel
            .shell()
            .map_err(|e| JarvisError::Upstream {
                host: host.to_owned(),
                path: "shell".to_owned(),
                detail: e.to_string(),
            })?;
        conn.session.set_blocking(false);

        Ok(PtyHandle {
            channel: Mutex::new(channel),
        })
    }

    pub fn close_all(&self) {
        self.conns.lock().expect("ssh pool lock poisoned").clear();
    }
}

/// Run `pool.exec_blocking` on the blocking pool, racing it against an
/// external deadline timer, because the SSH library offers no native
/// command timeout.
pub async fn exec_with_timeout(
    pool: Arc<SshPool>,
    host: String,
    cmd: String,
    timeout_ms: u64,
) -> JarvisResult<ExecResult> {
    let task = tokio::task::spawn_blocking(move || pool.exec_blocking(&host, &cmd));

    match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(JarvisError::Internal(format!(
            "ssh exec task panicked: {join_err}"
        ))),
        Err(_) => Err(JarvisError::Timeout {
            what: "ssh_exec".to_owned(),
            secs: timeout_ms / 1000,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_empty() {
        let pool = SshPool::new("/dev/null", "root", 10);
        assert!(pool.conns.lock().unwrap().is_empty());
    }

    #[test]
    fn close_all_clears_pool() {
        let pool = SshPool::new("/dev/null", "root", 10);
        pool.close_all();
        assert!(pool.conns.lock().unwrap().is_empty());
    }
}
