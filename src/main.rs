use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use taskbot::config::{AppConfig, ScheduleConfig};
use taskbot::coordinator::{Coordinator, RequestSender};
use taskbot::notify::LogNotifier;
use taskbot::store::ResultStore;
use taskbot::task::{InstanceId, NotifierId, RunRequest};
use taskbot::tasks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("🤖 taskbot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data dir: {}", config.data_dir.display());
    eprintln!("   Schedule: {}", config.schedule_path.display());

    let schedule = ScheduleConfig::load(&config.schedule_path)?;
    let registry = tasks::builtin_registry(&config)?;
    let store = Arc::new(ResultStore::new(
        config.app_name.clone(),
        config.data_dir.clone(),
    ));

    let coordinator =
        Coordinator::new(registry, store).with_queue_capacity(config.request_queue_capacity);
    coordinator.set_notification_sender(Arc::new(LogNotifier));

    let shutdown = CancellationToken::new();
    coordinator.start(&schedule, &shutdown).await?;
    let requests = coordinator.requests().await?;

    eprintln!("   Commands: run <task> <command> | cancel <instance> | list | quit\n");

    // ── Command loop ────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_command(line) {
                        Ok(Command::Quit) => break,
                        Ok(command) => {
                            execute(command, &coordinator, &requests, &config.default_notifier).await
                        }
                        Err(usage) => eprintln!("{usage}"),
                    }
                }
                Ok(None) => {
                    // Detached from a terminal; keep serving the schedule.
                    stdin_open = false;
                }
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    stdin_open = false;
                }
            }
        }
    }

    eprintln!("Stopping, waiting for running tasks to finish...");
    coordinator.stop().await;
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskbot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Run { task: String, command: String },
    Cancel(String),
    List,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["run", task, command] => Ok(Command::Run {
            task: task.to_string(),
            command: command.to_string(),
        }),
        ["cancel", instance] => Ok(Command::Cancel(instance.to_string())),
        ["list"] => Ok(Command::List),
        ["quit"] | ["exit"] => Ok(Command::Quit),
        _ => Err("usage: run <task> <command> | cancel <instance> | list | quit".to_string()),
    }
}

async fn execute(
    command: Command,
    coordinator: &Coordinator,
    requests: &RequestSender,
    notifier: &NotifierId,
) {
    let result = match command {
        Command::Run { task, command } => {
            requests
                .run(RunRequest::by_user(task, command, notifier.clone()))
                .await
        }
        Command::Cancel(instance) => requests.cancel(InstanceId::new(instance)).await,
        Command::List => {
            let instances = coordinator.running_instances().await;
            if instances.is_empty() {
                eprintln!("No running tasks");
            }
            for info in instances {
                eprintln!(
                    "{}  {}/{}  by {}  {}s{}",
                    info.instance_id,
                    info.task_kind,
                    info.command_kind,
                    info.run_by,
                    info.elapsed.as_secs(),
                    if info.canceled { "  (canceling)" } else { "" }
                );
            }
            Ok(())
        }
        Command::Quit => Ok(()),
    };

    if let Err(e) = result {
        tracing::error!("Command failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_command("run site watch"),
            Ok(Command::Run {
                task: "site".to_string(),
                command: "watch".to_string()
            })
        );
        assert_eq!(parse_command("cancel 1Z"), Ok(Command::Cancel("1Z".to_string())));
        assert_eq!(parse_command("list"), Ok(Command::List));
        assert_eq!(parse_command("exit"), Ok(Command::Quit));
        assert!(parse_command("run site").is_err());
        assert!(parse_command("dance").is_err());
    }
}
