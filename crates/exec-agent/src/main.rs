use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use exec_agent::{AgentConfig, EventBus, ProcessSupervisor};
use exec_protocol::{EventMessage, StartProcessParams};

/// Run a command and stream its process events to stdout as JSON lines
#[derive(Debug, Parser)]
#[command(name = "exec-agent", version)]
struct Cli {
    /// Config file (default: ~/.exec-agent/config.toml)
    #[arg(long, env = "EXEC_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Process name (default: first word of the command)
    #[arg(long)]
    name: Option<String>,

    /// Shell used to run the command line
    #[arg(long)]
    shell: Option<String>,

    /// Working directory for the process
    #[arg(long)]
    workdir: Option<String>,

    /// Command to run. A single argument is passed to the shell as is, so it
    /// may use pipes and redirects; several arguments are quoted word by word
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr, stdout carries the event stream
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref())?;
    if let Some(shell) = cli.shell {
        config.process.shell = shell;
    }

    let agent_id = Uuid::new_v4();
    tracing::info!(
        agent_id = %agent_id,
        name = %config.agent_name(),
        shell = %config.shell(),
        "exec-agent starting"
    );

    let supervisor = ProcessSupervisor::new(&config, EventBus::new(config.event_buffer()));
    let mut rx = supervisor.events().subscribe();

    let name = cli
        .name
        .or_else(|| cli.command.first().cloned())
        .unwrap_or_default();
    let process = supervisor
        .start(StartProcessParams {
            name,
            command_line: command_line(&cli.command),
            workdir: cli.workdir,
        })
        .await?;

    let mut stdout = tokio::io::stdout();
    loop {
        let event = tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "event stream lagged, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(pid = process.pid, "interrupted, stopping process");
                supervisor.kill_all().await;
                continue;
            }
        };

        if event.pid() != process.pid {
            continue;
        }

        let done = event.is_died();
        let line = EventMessage::new(event, agent_id.to_string()).to_json_line()?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;

        if done {
            break;
        }
    }

    let exit_code = supervisor.get(process.pid).await?.exit_code.unwrap_or(1);
    tracing::info!(pid = process.pid, exit_code = exit_code, "exec-agent finished");
    std::process::exit(exit_code);
}

/// Build the shell command line for the trailing arguments.
fn command_line(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        words => words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" "),
    }
}

/// Quote `word` for a POSIX shell, leaving plain words untouched.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
