//! Long-running JARVIS process. Loads configuration, wires every subsystem
//! together, binds the gateway router, and serves until SIGINT.
//!
//! PID-file provisioning and port-fallback binding, widened from one
//! router to the full component graph this daemon assembles.

use std::{
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

use jarvis_core::{
    agent::{AgentLoop, AgentLoopConfig, IntentRouter},
    ai::{HttpProvider, ReliableProvider},
    config::{load_default_config, schema::AppConfig},
    event_bus::{EventBus, TokioBroadcastBus},
    gateway::{router, GatewayState, GatewayStateInner},
    infra::{ContainerRestartController, ProxmoxClient, SshPool},
    persistence::{Persistence, SqlitePersistence},
    security::SecurityPolicy,
    stt::HttpSttClient,
    telemetry::TelemetryEmitter,
    tools::{builtin::register_all, ToolExecutor, ToolRegistry},
    tts::{EngineHealth, HttpTtsBackend, TtsPipeline, TwoTierCache},
};
use uuid::Uuid;

const MAX_PORT_ATTEMPTS: u16 = 10;

fn data_dir(config: &AppConfig) -> PathBuf {
    config
        .server
        .data_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| dirs::data_dir().map(|d| d.join("jarvis")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn pid_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("jarvis-daemon.pid")
}

fn write_pid_file(data_dir: &std::path::Path, port: u16) -> Result<(), String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("failed to create data dir: {e}"))?;
    let content = format!("{}\n{}\n", std::process::id(), port);
    fs::write(pid_path(data_dir), content).map_err(|e| format!("failed to write pid file: {e}"))
}

/// Reads `<dataDir>/jwt_secret`, creating it with a fresh random value if
/// absent. Used only when `JWT_SECRET`/`server.jwt_secret` isn't set, so a
/// restart doesn't silently invalidate every issued bearer token.
fn load_or_create_jwt_secret(data_dir: &std::path::Path) -> Result<String, String> {
    let path = data_dir.join("jwt_secret");
    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim().to_owned();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }

    fs::create_dir_all(data_dir).map_err(|e| format!("failed to create data dir: {e}"))?;
    let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    fs::write(&path, &secret).map_err(|e| format!("failed to write jwt secret: {e}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
    }
    Ok(secret)
}

async fn bind_with_fallback(start_port: u16) -> Result<TcpListener, String> {
    for offset in 0..MAX_PORT_ATTEMPTS {
        let port = start_port + offset;
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid addr");
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(_) if offset + 1 < MAX_PORT_ATTEMPTS => continue,
            Err(e) => {
                return Err(format!(
                    "could not bind to any port in {start_port}-{}: {e}",
                    start_port + MAX_PORT_ATTEMPTS - 1
                ));
            }
        }
    }
    unreachable!()
}

fn init_tracing(data_dir: &std::path::Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,jarvis=debug"));
    let log_dir = data_dir.join("logs");
    let _ = fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "jarvis.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive the process, and this
    // function only ever runs once at startup.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stdout))
        .init();
}

async fn run() -> Result<(), String> {
    jarvis_core::install_crypto_provider();

    let config = load_default_config();
    let dir = data_dir(&config);
    init_tracing(&dir);
    tracing::info!("starting jarvis-daemon, data dir {}", dir.display());

    let db_path = if std::path::Path::new(&config.database.path).is_absolute() {
        PathBuf::from(&config.database.path)
    } else {
        dir.join(&config.database.path)
    };
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::open(&db_path.to_string_lossy()).map_err(|e| format!("persistence: {e}"))?);

    let bus: Arc<dyn EventBus> = Arc::new(TokioBroadcastBus::new());

    let proxmox = Arc::new(ProxmoxClient::from_config(&config.proxmox).map_err(|e| e.to_string())?);
    let ssh = Arc::new(SshPool::new(
        config.ssh.key_path.clone(),
        config.ssh.user.clone(),
        config.ssh.connect_timeout_secs,
    ));

    let policy = Arc::new(SecurityPolicy::from_config(&config.security));

    let mut registry = ToolRegistry::new();
    register_all(
        &mut registry,
        proxmox.clone(),
        ssh.clone(),
        config.proxmox.nodes.clone(),
        config.ssh.command_timeout_secs * 1000,
    );
    let registry = Arc::new(registry);

    let executor = Arc::new(ToolExecutor::new(registry.clone(), policy.clone(), persistence.clone(), bus.clone()));

    let conversational_provider: Arc<dyn jarvis_core::ai::LLMProvider> = Arc::new(ReliableProvider::new(Arc::new(
        HttpProvider::new(
            config.llm.conversational_endpoint.clone(),
            None,
            "conversational",
            8_000,
            false,
            config.llm.request_timeout_secs,
        )
        .map_err(|e| e.to_string())?,
    )));
    let agentic_provider: Arc<dyn jarvis_core::ai::LLMProvider> = Arc::new(ReliableProvider::new(Arc::new(
        HttpProvider::new(
            config.llm.agentic_endpoint.clone(),
            Some(config.llm.agentic_api_key.clone()).filter(|k| !k.is_empty()),
            "agentic",
            32_000,
            true,
            config.llm.request_timeout_secs,
        )
        .map_err(|e| e.to_string())?,
    )));

    let conversational_loop = Arc::new(AgentLoop::new(
        conversational_provider,
        registry.clone(),
        executor.clone(),
        AgentLoopConfig {
            model: "conversational".to_owned(),
            system_prompt: "You are JARVIS, a concise voice assistant for a home Proxmox cluster. \
                Answer briefly; you have no tools in this mode."
                .to_owned(),
            max_iterations: 1,
            ..AgentLoopConfig::default()
        },
    ));
    let agentic_loop = Arc::new(AgentLoop::new(
        agentic_provider,
        registry.clone(),
        executor.clone(),
        AgentLoopConfig {
            model: "agentic".to_owned(),
            system_prompt: "You are JARVIS, an operator assistant for a four-node home Proxmox cluster. \
                You may call tools to inspect or change cluster state; destructive actions require \
                operator confirmation."
                .to_owned(),
            max_iterations: config.llm.max_iterations as usize,
            ..AgentLoopConfig::default()
        },
    ));

    let cache = Arc::new(TwoTierCache::new(
        dir.join(&config.tts.cache_dir),
        config.tts.cache_max_memory,
        config.tts.cache_max_disk_per_engine,
    ));
    let primary_backend: Arc<dyn jarvis_core::tts::TtsBackend> = Arc::new(
        HttpTtsBackend::new(
            config.tts.primary_endpoint.clone(),
            "primary",
            Duration::from_millis(config.tts.synth_deadline_ms),
        )
        .map_err(|e| e.to_string())?,
    );
    let fallback_backend: Arc<dyn jarvis_core::tts::TtsBackend> = Arc::new(
        HttpTtsBackend::new(
            config.tts.fallback_endpoint.clone(),
            "fallback",
            Duration::from_millis(config.tts.synth_deadline_ms),
        )
        .map_err(|e| e.to_string())?,
    );
    let primary_healthy = Arc::new(AtomicBool::new(true));
    let tts = Arc::new(TtsPipeline::new(
        primary_backend.clone(),
        fallback_backend,
        cache,
        None,
        config.tts.max_parallel,
        Duration::from_millis(config.tts.synth_deadline_ms),
        primary_healthy.clone(),
    ));

    let restart_controller = Arc::new(ContainerRestartController::new(config.tts.restart_socket_path.clone()));
    let health = Arc::new(EngineHealth::new(
        primary_backend,
        restart_controller,
        Duration::from_secs(config.tts.restart_cooldown_secs),
        primary_healthy,
    ));
    tokio::spawn(health_poll_loop(health, Duration::from_secs(config.tts.health_check_interval_secs)));

    let stt: Arc<dyn jarvis_core::stt::SttPort> =
        Arc::new(HttpSttClient::new(config.stt.endpoint.clone(), config.stt.request_timeout_secs).map_err(|e| e.to_string())?);

    let telemetry = Arc::new(TelemetryEmitter::new(proxmox.clone(), bus.clone(), config.telemetry.clone()));
    let telemetry_handles = telemetry.spawn();

    let router_state = IntentRouter::new(policy.clone());

    let jwt_secret = if config.server.jwt_secret.is_empty() {
        load_or_create_jwt_secret(&dir)?
    } else {
        config.server.jwt_secret.clone()
    };

    let state = GatewayState(Arc::new(GatewayStateInner {
        bus: bus.clone(),
        persistence,
        proxmox,
        ssh: ssh.clone(),
        ssh_deadline_ms: config.ssh.command_timeout_secs * 1000,
        nodes: config.proxmox.nodes.clone(),
        registry,
        executor,
        policy,
        router: Arc::new(router_state),
        conversational_loop,
        agentic_loop,
        tts,
        stt,
        telemetry,
        sessions: DashMap::new(),
        security_config: config.security.clone(),
        jwt_secret,
        password: config.security.password.clone(),
        context_window_turns: config.llm.context_window_turns,
        context_token_budget: config.llm.context_token_budget,
        summarize_threshold_tokens: config.llm.summarize_threshold_tokens,
    }));

    let app = router(state);
    let listener = bind_with_fallback(config.server.port).await.map_err(|e| {
        tracing::error!("bind failed: {e}");
        e
    })?;
    let addr = listener.local_addr().map_err(|e| e.to_string())?;
    write_pid_file(&dir, addr.port())?;
    tracing::info!("jarvis-daemon listening on {addr}");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| format!("server error: {e}"))?;

    for handle in telemetry_handles {
        handle.abort();
    }
    ssh.close_all();
    let _ = fs::remove_file(pid_path(&dir));

    Ok(())
}

/// Runs the primary-engine health probe on a fixed interval, independent of
/// the telemetry pollers.
async fn health_poll_loop(health: Arc<EngineHealth>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        health.check().await;
    }
}

fn main() {
    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    match rt.block_on(run()) {
        Ok(()) => std::process::exit(130),
        Err(e) => {
            eprintln!("fatal startup error: {e}");
            std::process::exit(1);
        }
    }
}
