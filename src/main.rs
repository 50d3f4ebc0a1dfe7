use a2a_relay::config::ServerConfig;
use a2a_relay::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; logs go to a rolling file when A2A_LOG_DIR is
    // set, stderr otherwise. The guard must outlive main.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("A2A_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "a2a-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = ServerConfig::from_env();

    eprintln!("🔁 A2A Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {}", config.agent_name);
    eprintln!("   Database: {}", config.db_path);
    eprintln!(
        "   Task timeout: {}s (sweep every {}s)",
        config.task_timeout.as_secs(),
        config.sweep_interval.as_secs()
    );
    match config.directory_url {
        Some(ref url) => eprintln!("   Directory: {url}"),
        None => eprintln!("   Directory: none (standalone)"),
    }

    let running = server::start(config).await?;
    eprintln!("   Listening on http://0.0.0.0:{}\n", running.port());

    tokio::signal::ctrl_c().await?;
    running.shutdown().await;

    Ok(())
}
