//! `jsbridge`: run scripts through an engine session from the command line.
#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use jsbridge::logging::{self, LogSeverity};
use jsbridge::{BridgeConfig, EngineSession, LifecycleState};
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "jsbridge")]
#[command(about = "Evaluate JavaScript on a dedicated engine thread")]
struct Args {
    /// Engine working directory (module resolution root).
    #[arg(long, short = 'C', default_value = ".")]
    working_dir: PathBuf,
    /// Script files to define before start, in order.
    #[arg(long = "script", short = 's')]
    scripts: Vec<PathBuf>,
    /// Expressions to evaluate once running; each result is printed as JSON.
    #[arg(long = "eval", short = 'e')]
    evals: Vec<String>,
    /// Names scripts may call back into; calls are printed to stdout.
    #[arg(long = "register", short = 'r')]
    registers: Vec<String>,
    /// json5 configuration file.
    #[arg(long, env = "JSBRIDGE_CONFIG")]
    config: Option<PathBuf>,
    /// error, warning, info, verbose or trace.
    #[arg(long)]
    log_level: Option<String>,
    /// Print the final session state and dispatcher counters.
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => BridgeConfig::from_env(),
    };
    if let Some(raw) = &args.log_level {
        let Some(level) = LogSeverity::parse(raw) else {
            bail!("unknown log level '{raw}'");
        };
        config.log_level = level;
    }
    logging::init_tracing(config.log_level, true);

    let session = EngineSession::new(&config).context("create engine session")?;
    for name in &args.registers {
        session
            .register_call_from_script(name, |function, args_json| {
                println!("{}", json!({ "call": function, "args": args_json }));
            })?
            .wait()?;
    }
    for path in &args.scripts {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("read script {}", path.display()))?;
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        session.define_script_file(name, source)?.wait()?;
    }

    let outcome = run(&session, &args);
    session.stop()?.wait()?;
    if args.stats {
        let telemetry = session.telemetry();
        eprintln!(
            "state={} executed={} panicked={} discarded={} watchdog_flags={}",
            session.state(),
            telemetry.executed,
            telemetry.panicked,
            telemetry.discarded,
            telemetry.watchdog_flags
        );
    }
    outcome
}

fn run(session: &EngineSession, args: &Args) -> Result<()> {
    if let Err(failure) = session.start(&args.working_dir)?.wait() {
        eprintln!("{}", failure.to_json());
        bail!("engine failed to start");
    }
    let mut failed = 0usize;
    for code in &args.evals {
        match session.call_script(code.as_str())?.wait() {
            Ok(result) => println!("{result}"),
            Err(failure) => {
                failed += 1;
                eprintln!("{}", failure.to_json());
                if session.state() == LifecycleState::Faulted {
                    break;
                }
            }
        }
    }
    if failed > 0 {
        bail!("{failed} evaluation(s) failed");
    }
    Ok(())
}
