use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use portal_sync::{
    CommandKind, CommandTarget, Config, ControlTransport, MemoryTransport, PortalController,
    SystemClock, TracingSink, WebSocketTransport, format_amount,
};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Operator console for the portal control channel")]
struct Args {
    /// Control channel URL. Overrides PORTAL_CONTROL_URL.
    #[arg(long)]
    url: Option<String>,

    /// Run on simulated traffic without contacting the control channel.
    #[arg(long)]
    simulate: bool,

    /// Seconds between snapshot log lines.
    #[arg(long, default_value_t = 15)]
    snapshot_interval_secs: u64,
}

#[derive(Debug, PartialEq)]
enum OperatorInput {
    Dispatch {
        command: CommandKind,
        target: CommandTarget,
        params: Map<String, Value>,
    },
    Snapshot,
    Quit,
}

/// `<command> <all|portal> [message...]`, `snapshot` or `quit`.
fn parse_operator_line(line: &str) -> Result<Option<OperatorInput>> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(None);
    };
    match first {
        "snapshot" => return Ok(Some(OperatorInput::Snapshot)),
        "quit" | "exit" => return Ok(Some(OperatorInput::Quit)),
        _ => {}
    }

    let command = CommandKind::parse(first).ok_or_else(|| {
        let known = CommandKind::ALL.map(CommandKind::id).join(", ");
        anyhow!("unknown command `{first}` (known: {known})")
    })?;
    let target = match words.next() {
        Some(raw) => {
            CommandTarget::parse(raw).ok_or_else(|| anyhow!("unknown target `{raw}`"))?
        }
        None => CommandTarget::All,
    };
    let mut params = Map::new();
    let message = words.collect::<Vec<_>>().join(" ");
    if !message.is_empty() {
        params.insert("message".to_string(), Value::String(message));
    }
    Ok(Some(OperatorInput::Dispatch {
        command,
        target,
        params,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("load portal control config")?;
    if let Some(url) = args.url {
        config.control_url = url;
    }
    config.simulate_only |= args.simulate;
    if args.snapshot_interval_secs == 0 {
        bail!("--snapshot-interval-secs must be positive");
    }

    let transport: Arc<dyn ControlTransport> = if config.simulate_only {
        let (transport, _accepted) = MemoryTransport::new();
        Arc::new(transport)
    } else {
        Arc::new(
            WebSocketTransport::new(&config.control_url, config.connect_timeout)
                .with_context(|| format!("invalid control url {}", config.control_url))?,
        )
    };
    info!(
        url = %config.control_url,
        simulate = config.simulate_only,
        "starting portal console"
    );

    let controller = PortalController::spawn(
        config,
        transport,
        Arc::new(TracingSink),
        Arc::new(SystemClock),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.snapshot_interval_secs));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = ticker.tick() => log_snapshot(&controller)?,
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("read operator input")? else {
                    stdin_open = false;
                    continue;
                };
                match parse_operator_line(&line) {
                    Ok(Some(OperatorInput::Dispatch { command, target, params })) => {
                        match controller.dispatch(command.id(), target, params).await {
                            Ok(outcome) => info!(
                                command = outcome.command.id(),
                                target = %outcome.target,
                                path = outcome.path.as_str(),
                                id = %outcome.request_id,
                                "command dispatched"
                            ),
                            Err(error) => warn!(%error, "command rejected"),
                        }
                    }
                    Ok(Some(OperatorInput::Snapshot)) => log_snapshot(&controller)?,
                    Ok(Some(OperatorInput::Quit)) => break,
                    Ok(None) => {}
                    Err(error) => warn!(%error, "could not parse operator input"),
                }
            }
        }
    }

    controller.stop().await.context("stop control runtime")?;
    Ok(())
}

fn log_snapshot(controller: &PortalController) -> Result<()> {
    let snapshot = controller.snapshot();
    info!(
        phase = snapshot.connection.phase.as_str(),
        attempt = snapshot.connection.attempt,
        simulated = snapshot.simulated,
        active_users = snapshot.metrics.total_active_users,
        transactions = snapshot.metrics.total_transactions,
        revenue = %format_amount(snapshot.metrics.real_time_revenue),
        health = snapshot.metrics.system_health.as_str(),
        "portal snapshot"
    );
    let portals = serde_json::to_string(&snapshot.portals).context("encode portal snapshot")?;
    info!(%portals, "portal states");
    Ok(())
}
