//! pulse-daemon: the agent-pulse background worker.
//!
//! `run` executes the worker in the foreground; `start`/`stop`/`status`
//! control a detached instance. Control output is one line of JSON per
//! invocation so launchers can parse it.

use pulse_daemon::config::DaemonConfig;
use pulse_daemon::{service, worker};
use pulse_store::paths::DataDir;

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("pulse={level}")));

    let json = std::env::var("LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json(value: serde_json::Value) {
    println!("{value}");
}

fn print_error(e: &pulse_daemon::WorkerError) {
    let code = e.code();
    let mut out = serde_json::json!({
        "ok": false,
        "code": code.as_str(),
        "error": e.to_string(),
    });
    if let Some(suggestion) = code.suggestion() {
        out["suggestion"] = serde_json::json!(suggestion);
    }
    print_json(out);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");
    let ephemeral = args.iter().any(|a| a == "--ephemeral");

    let data = DataDir::resolve_default();

    match command {
        "run" => {
            let mut config = DaemonConfig::load(&data)?;
            if ephemeral {
                config.ephemeral = true;
            }
            if let Err(e) = worker::run(data, config).await {
                tracing::error!(error = %e, "worker failed");
                return Err(e.into());
            }
        }
        "start" => match service::start(&data, ephemeral) {
            Ok(pid) => print_json(serde_json::json!({"ok": true, "pid": pid})),
            Err(e) => print_error(&e),
        },
        "stop" => match service::stop(&data) {
            Ok(()) => print_json(serde_json::json!({"ok": true})),
            Err(e) => print_error(&e),
        },
        "status" => {
            let running = service::is_running(&data);
            let health = pulse_daemon::health::read_snapshot(&data).unwrap_or(None);
            print_json(serde_json::json!({
                "ok": true,
                "running": running,
                "pid": service::read_pid(&data),
                "health": health,
            }));
        }
        other => {
            print_json(serde_json::json!({
                "ok": false,
                "code": "UNKNOWN_COMMAND",
                "error": format!("unknown command {other}"),
                "suggestion": "use run | start | stop | status",
            }));
        }
    }
    Ok(())
}
