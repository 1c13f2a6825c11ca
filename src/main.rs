use clap::Parser;
use procwarden::{config, signals, Supervisor, ESCALATION_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;

/// Supervise a single helper process: launch it, forward or discard its
/// output depending on verbosity, and tear it down cleanly on exit.
#[derive(Parser, Debug)]
#[command(name = "procwarden", version, about)]
struct Cli {
    /// Command to supervise, with its arguments (overrides config)
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    command: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Extra logging; also forwards the child's stdout/stderr
    #[arg(short, long)]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config);

    let level = if cli.verbose {
        "debug".to_string()
    } else if cli.quiet {
        "error".to_string()
    } else {
        cfg.log.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("procwarden={level}"))),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    // A positional command replaces the config's [child] table wholesale.
    let (command, args) = match cli.command.split_first() {
        Some((cmd, rest)) => (cmd.clone(), rest.to_vec()),
        None => (cfg.child.command.clone(), cfg.child.args.clone()),
    };

    if command.is_empty() {
        eprintln!(
            "No command to supervise: pass one on the command line or set [child] command in {}",
            cli.config.display()
        );
        std::process::exit(2);
    }

    if cli.dry_run {
        println!("procwarden v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Command:     {command}");
        println!("Args:        {args:?}");
        return;
    }

    let supervisor = Supervisor::new(command.clone());
    if let Err(e) = supervisor.try_start(&args) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    tracing::info!(pid = ?supervisor.pid(), %command, "supervising child");

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    let mut poll = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, stopping child");
                let pid = supervisor.pid();
                supervisor.stop();
                await_teardown(pid).await;
                break;
            }
            _ = poll.tick() => {
                if !supervisor.is_running() {
                    tracing::info!("child exited");
                    break;
                }
            }
        }
    }
}

/// Wait for a stopped child to disappear from the OS, bounded by the
/// escalation timeout plus scheduling slack, so the runtime is not torn
/// down while the termination path is still in flight.
#[cfg(unix)]
async fn await_teardown(pid: Option<u32>) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let deadline = std::time::Instant::now() + ESCALATION_TIMEOUT + Duration::from_secs(1);
    while std::time::Instant::now() < deadline {
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!(%pid, "child still present after escalation window");
}

#[cfg(not(unix))]
async fn await_teardown(pid: Option<u32>) {
    if pid.is_some() {
        tokio::time::sleep(ESCALATION_TIMEOUT + Duration::from_secs(1)).await;
    }
}
