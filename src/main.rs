use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use reserva::command;
use reserva::config::Config;
use reserva::engine::Engine;
use reserva::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    reserva::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(config.wal_path(), notify, config.engine_config())?;

    info!("reserva ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  max_admission_retries: {}", config.max_admission_retries);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let response = match command::parse(&line) {
            Ok(cmd) => {
                let label = reserva::observability::command_label(&cmd);
                let started = Instant::now();
                let response = command::execute(&engine, cmd).await;
                let status = if response["ok"] == true { "ok" } else { "error" };
                metrics::counter!(reserva::observability::COMMANDS_TOTAL, "command" => label, "status" => status)
                    .increment(1);
                metrics::histogram!(reserva::observability::COMMAND_DURATION_SECONDS, "command" => label)
                    .record(started.elapsed().as_secs_f64());
                response
            }
            Err(e) => command::parse_error_response(&e),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;

        if let Err(e) = engine.compact_if_needed(config.compact_threshold).await {
            tracing::error!("compaction failed: {e}");
        }
    }

    info!("reserva stopped");
    Ok(())
}
