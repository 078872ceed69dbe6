//! Out-of-band stop for a running attractor engine.
//!
//! Reads `run.pid` under the logs root, delivers SIGTERM, and waits for
//! the grace period; `--force` escalates to SIGKILL. Exit 0 on a graceful
//! or forced stop, 1 on any error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use attractor::runstate::stop_run;

#[derive(Parser)]
#[command(name = "attractor-stop", about = "Stop a running attractor engine")]
struct Args {
    /// Logs root of the run to stop (contains run.pid).
    #[arg(long = "logs-root")]
    logs_root: PathBuf,

    /// Grace period in milliseconds before giving up (or escalating).
    #[arg(long = "grace-ms", default_value_t = 5000)]
    grace_ms: u64,

    /// Escalate to SIGKILL when the grace period elapses.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Exit 1 on argument errors too; 2 is clap's default. Help and
    // version requests stay exit 0.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let failed = e.use_stderr();
            let _ = e.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    match stop_run(
        &args.logs_root,
        Duration::from_millis(args.grace_ms),
        args.force,
    )
    .await
    {
        Ok(report) => {
            println!("pid={}", report.pid);
            println!("stopped={}", report.stopped.as_str());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
