//! jailrun - run a command jailed inside a tar image.
//!
//! ## Usage
//!
//! ```sh
//! jailrun [-port N] [-env K=V,...] [-wd PATH] run URL|path cmd [args...]
//! jailrun [-port N] ps
//! jailrun [-port N] kill [signal]
//! ```
//!
//! The kernel re-enters this binary with `tfork` at argv[0] for the
//! second container stage; that check runs before anything else, or the
//! namespace entry would recurse into the CLI.

use jailrun::constants::{DEFAULT_LISTENING_PORT, TASK_FORK_NAME};
use jailrun::{container, supervisor, Error, Supervisor, Task};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run {
        url: String,
        program: String,
        args: Vec<String>,
    },
    Ps,
    Kill {
        signal: String,
    },
    Help,
}

#[derive(Debug)]
struct Options {
    port: u16,
    env: HashMap<String, String>,
    wd: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut port = DEFAULT_LISTENING_PORT;
    let mut env = HashMap::new();
    let mut wd = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-port" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-port requires a value".to_string())?;
                port = value
                    .parse()
                    .map_err(|_| format!("invalid port: {value}"))?;
                i += 2;
            }
            "-env" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-env requires a value".to_string())?;
                for pair in value.split(',') {
                    let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
                    env.insert(key.to_string(), val.to_string());
                }
                i += 2;
            }
            "-wd" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| "-wd requires a value".to_string())?;
                wd = Some(PathBuf::from(value));
                i += 2;
            }
            "-h" | "-help" | "--help" => {
                return Ok(Options {
                    port,
                    env,
                    wd,
                    command: Command::Help,
                });
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag: {flag}")),
            _ => break,
        }
    }

    let command = match args.get(i).map(String::as_str) {
        Some("run") => {
            let url = args
                .get(i + 1)
                .ok_or_else(|| "Missing URL and command to run".to_string())?
                .clone();
            let program = args
                .get(i + 2)
                .ok_or_else(|| "Missing command to run".to_string())?
                .clone();
            Command::Run {
                url,
                program,
                args: args[i + 3..].to_vec(),
            }
        }
        Some("ps") => Command::Ps,
        Some("kill") => Command::Kill {
            signal: args
                .get(i + 1)
                .cloned()
                .unwrap_or_else(|| "SIGKILL".to_string()),
        },
        Some(unknown) => return Err(format!("unknown subcommand: {unknown}")),
        None => return Err("missing subcommand".to_string()),
    };

    Ok(Options {
        port,
        env,
        wd,
        command,
    })
}

fn print_usage() {
    eprintln!(
        r#"Usage: jailrun [flags] <subcommand> [arguments]

  Available subcommands: run, ps, kill

    [-env=[]|-wd] run URL|path cmd [args...]

        Run cmd inside an image (jailed) which is available at the given URL.
        Only file and HTTP(S) schemes are supported.
        Only TAR images compressed or not with GZ are supported.

    ps

        Get the status of the task launched with the run subcommand.

    kill [signal]

        Send a signal to the task launched with the run subcommand.
        Possible signal values: SIGKILL (default), SIGTERM, SIGINT,
        SIGSTOP, SIGCONT, SIGUSR1, SIGUSR2

FLAGS:
    -port <int>    Supervisor listening port to query the task (default {DEFAULT_LISTENING_PORT})
    -env <K=V,..>  New environment variables available for the task
    -wd <path>     Working directory to run the task
"#
    );
}

// =============================================================================
// Container Stage
// =============================================================================

/// Second-stage entry: argv is `[-wd <path>]? <cmd> [args...]`, the
/// current directory is the extracted root.
fn container_main(args: &[String]) -> ExitCode {
    let (wd, command) = match args.first().map(String::as_str) {
        Some("-wd") => {
            let Some(path) = args.get(1) else {
                eprintln!("Run container error: -wd requires a value");
                return ExitCode::FAILURE;
            };
            (Some(PathBuf::from(path)), &args[2..])
        }
        _ => (None, args),
    };

    match container::run(wd.as_deref(), command) {
        Ok(never) => match never {},
        Err(e) => {
            eprintln!("Run container error: {e}");
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Subcommands
// =============================================================================

async fn cmd_run(
    url: String,
    program: String,
    args: Vec<String>,
    port: u16,
    env: HashMap<String, String>,
    wd: Option<PathBuf>,
) -> ExitCode {
    let task = match Task::new(&url, &program, &args) {
        Ok(task) => Arc::new(task),
        Err(e) => {
            eprintln!("Impossible to create task: {e}");
            return ExitCode::FAILURE;
        }
    };

    // The supervisor only sees the task once it is published below.
    let (publish, subscribe) = oneshot::channel();
    tokio::spawn(async move {
        match Supervisor::new(subscribe, port).await {
            Ok(supervisor) => {
                if let Err(e) = supervisor.listen_and_serve().await {
                    error!("supervisor: {e}");
                }
            }
            Err(e) => error!("supervisor: {e}"),
        }
    });
    let _ = publish.send(task.clone());

    if let Err(e) = task.start_jailed(wd.as_deref(), &env).await {
        eprintln!("Impossible to start task: {e}");
        return ExitCode::FAILURE;
    }

    match task.wait().await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("Error waiting for the task: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_ps(port: u16) -> ExitCode {
    match supervisor::query_status(port).await {
        Ok(status) => {
            println!("Task status: {status}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Is task running or in a different port?");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_kill(port: u16, signal: String) -> ExitCode {
    match supervisor::send_signal(port, &signal).await {
        Ok(ack) => {
            println!("Task: {ack}");
            ExitCode::SUCCESS
        }
        Err(Error::SupervisorHttp { status, body }) => {
            eprintln!("ERROR {status}: {body}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Is task running or in a different port?");
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Sentinel check before anything else (see module docs).
    if args.first().map(String::as_str) == Some(TASK_FORK_NAME) {
        init_tracing();
        return container_main(&args[1..]);
    }

    init_tracing();

    let options = match parse_args(&args[1..]) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}\n");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    if matches!(options.command, Command::Help) {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let port = options.port;
    runtime.block_on(async {
        match options.command {
            Command::Run { url, program, args } => {
                cmd_run(url, program, args, port, options.env, options.wd).await
            }
            Command::Ps => cmd_ps(port).await,
            Command::Kill { signal } => cmd_kill(port, signal).await,
            Command::Help => ExitCode::SUCCESS,
        }
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
