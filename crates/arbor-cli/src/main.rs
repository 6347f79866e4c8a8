//! arbor CLI entry point.
//!
//! Usage:
//!   arbor master [OPTIONS]                  # Root of the tree
//!   arbor worker --parent=<addr> [OPTIONS]  # Interior or leaf node
//!   arbor exec <spec> <cmd> [args...]       # Run a command across the tree
//!   arbor info                              # List the root's children

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use arbor_client::{IpcClient, RequestBuilder, TreeClient};
use arbor_kernel::launch::launch_role;
use arbor_kernel::{Locale, Master, NodeConfig, Role, ShellEvaluator, StaticLocale, Worker, nodespec, shared_sink};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    // The launch role replaces itself with the command; no runtime, no logging.
    if args.get(1).map(String::as_str) == Some(arbor_kernel::launch::LAUNCH_ROLE) {
        return ExitCode::from(launch_role(&args[2..]) as u8);
    }

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arbor=info")))
        .init();

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<ExitCode> {
    match args.get(1).map(|s| s.as_str()) {
        None | Some("--help" | "-h") => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }

        Some("--version" | "-V") => {
            println!(
                "arbor {} ({} {})",
                env!("CARGO_PKG_VERSION"),
                env!("ARBOR_GIT_HASH"),
                env!("ARBOR_BUILD_DATE")
            );
            Ok(ExitCode::SUCCESS)
        }

        Some("master" | "m") => block_on(run_master(&args[2..])),
        Some("worker" | "s") => block_on(run_worker(&args[2..])),
        Some("exec" | "e") => block_on(run_exec(&args[2..])),
        Some("info" | "i") => block_on(run_info(&args[2..])),

        Some(unknown) => {
            eprintln!("Unknown role: {unknown}");
            eprintln!("Run 'arbor --help' for usage.");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn block_on<F>(fut: F) -> Result<ExitCode>
where
    F: std::future::Future<Output = Result<ExitCode>>,
{
    let rt = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    rt.block_on(fut)
}

fn print_help() {
    println!(
        r#"arbor v{}: run one command across a tree of nodes

Usage:
  arbor master [OPTIONS]                   Start the root node
  arbor worker --parent=<addr> [OPTIONS]   Start a node under <addr>
  arbor exec <spec> [EXEC OPTIONS] <cmd> [args...]
                                           Run <cmd> on the nodes <spec> selects
  arbor info [OPTIONS]                     List the root's children

Roles have one-letter aliases: m, s, e, i.

Options:
  --config=<path>              Config file (default: ~/.config/arbor/node.toml)
  --id=<id>                    Node id (default: assigned by the parent)
  --parent=<addr>              Parent's registration address
  --listen=<addr>              Registration and command address (default: 0.0.0.0:6666)
  --control=<endpoint>         Client endpoint of the root (default: $XDG_RUNTIME_DIR/arbor/master.sock)
  --relay-bind=<addr>          Where output relays listen (default: 0.0.0.0:0)
  --private-dir=<path>         Staging directory for received files
  --lib-path=<a:b:...>         Library directories, relative to the staging root
  --chunk-size=<bytes>         File chunk size on the wire
  --private-namespace          Isolate every command in a private mount namespace
  -h, --help                   Show this help
  -V, --version                Show version

Values starting with '=' are run through the shell, e.g. --id='=hostname -s'.

Exec Options:
  -f, --file <path>            Send <path> along (directories recursively)
  --env <KEY=VALUE>            Set a variable for the command
  --private                    Run in a private mount namespace
  --local                      Run <cmd> as found on each node; send nothing

Node specs:
  1-3          children 1, 2 and 3
  1-3/1-40     children 1 to 40 of each of 1, 2 and 3
  1,7,.        alternatives; '.' selects every child
"#,
        env!("CARGO_PKG_VERSION")
    );
}

// ============================================================================
// Options
// ============================================================================

/// Load the config file named by `--config=`, or the default one.
fn load_config(explicit: Option<&str>) -> Result<NodeConfig> {
    match explicit {
        Some(path) => NodeConfig::load_from(&PathBuf::from(path)),
        None => NodeConfig::load(),
    }
}

/// Load the config, then apply node options from `args`.
///
/// Returns the config and the arguments that were not node options.
fn configure(args: &[String]) -> Result<(NodeConfig, Vec<String>)> {
    let explicit = args.iter().find_map(|a| a.strip_prefix("--config="));
    let mut config = load_config(explicit)?;

    let mut rest = Vec::new();
    for arg in args {
        if arg.starts_with("--config=") {
            continue;
        }
        if apply_option(&mut config, arg)? {
            continue;
        }
        rest.push(arg.clone());
    }
    Ok((config, rest))
}

/// Apply one `--key=value` (or `--private-namespace`) option. False if `arg`
/// is not a node option.
fn apply_option(config: &mut NodeConfig, arg: &str) -> Result<bool> {
    if arg == "--private-namespace" {
        config.private_namespace = true;
        return Ok(true);
    }
    match arg.strip_prefix("--").and_then(|a| a.split_once('=')) {
        Some((key, value)) => config.set(key, value),
        None => Ok(false),
    }
}

/// Load, evaluate and check the config for a long-running node.
async fn node_config(args: &[String], role: Role) -> Result<(NodeConfig, StaticLocale)> {
    let (mut config, rest) = configure(args)?;
    if let Some(extra) = rest.first() {
        bail!("unexpected argument for {role}: {extra}");
    }
    config.resolve(&ShellEvaluator).await?;
    config.validate()?;
    let locale = StaticLocale::from_config(&config);
    locale.init(role)?;
    Ok((config, locale))
}

// ============================================================================
// Roles
// ============================================================================

async fn run_master(args: &[String]) -> Result<ExitCode> {
    let (config, _locale) = node_config(args, Role::Master).await?;
    let master = Master::bind(&config).await?;
    tracing::info!(
        "master up: control {}, registrations on {}",
        master.control_endpoint()?,
        master.listen_endpoint()?
    );
    master.serve().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_worker(args: &[String]) -> Result<ExitCode> {
    let (config, locale) = node_config(args, Role::Worker).await?;
    let worker = Worker::start_in(&config, &locale).await?;
    tracing::info!(
        "worker {} up on {}, staging in {}",
        worker.id(),
        worker.listen_endpoint()?,
        worker.private_dir().display()
    );
    worker.serve().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_exec(args: &[String]) -> Result<ExitCode> {
    let mut config_file = None;
    let mut options = Vec::new();
    let mut spec = None;
    let mut files = Vec::new();
    let mut env_overrides = Vec::new();
    let mut private = false;
    let mut local = false;
    let mut command = Vec::new();

    // Options up to the command; everything from the command on is its argv.
    let mut iter = args.iter().cloned();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--" => {
                command.extend(iter.by_ref());
                break;
            }
            "-f" | "--file" => files.push(iter.next().context("-f requires a path")?),
            "--env" => env_overrides.push(iter.next().context("--env requires KEY=VALUE")?),
            "--private" => private = true,
            "--local" => local = true,
            _ if arg.starts_with("--file=") => files.push(arg["--file=".len()..].to_string()),
            _ if arg.starts_with("--env=") => env_overrides.push(arg["--env=".len()..].to_string()),
            _ if arg.starts_with("--config=") => config_file = Some(arg["--config=".len()..].to_string()),
            _ if arg.starts_with('-') => options.push(arg),
            _ if spec.is_none() => spec = Some(arg),
            _ => {
                command.push(arg);
                command.extend(iter.by_ref());
                break;
            }
        }
    }

    let mut config = load_config(config_file.as_deref())?;
    for option in &options {
        if !apply_option(&mut config, option)? {
            bail!("unknown exec option: {option}");
        }
    }

    let spec = spec.context("exec requires a node spec")?;
    if command.is_empty() {
        bail!("exec requires a command");
    }
    // Refuse a malformed spec before touching the network.
    nodespec::validate(&spec)?;

    let mut builder = RequestBuilder::new(command)
        .nodes(spec)
        .private(private)
        .local(local)
        .lib_path(config.lib_path.clone());
    for file in files {
        builder = builder.file(file);
    }
    for entry in env_overrides {
        builder = builder.set_env(entry);
    }
    let req = builder.build().await?;
    tracing::debug!("sending {} file record(s)", req.files.len());

    let client = IpcClient::new(config.control_endpoint(), config.relay_endpoint());
    let sink = shared_sink(tokio::io::stdout());
    let outcome = client.exec(req, sink.clone()).await?;
    sink.lock().await.flush().await?;

    if outcome.summary.failed > 0 {
        eprintln!(
            "arbor: {} of {} node(s) did not report cleanly",
            outcome.summary.failed, outcome.dispatched
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_info(args: &[String]) -> Result<ExitCode> {
    let (config, rest) = configure(args)?;
    if let Some(extra) = rest.first() {
        bail!("unexpected argument for info: {extra}");
    }

    let client = IpcClient::new(config.control_endpoint(), config.relay_endpoint());
    let info = client.info().await?;
    if info.nodes.is_empty() {
        eprintln!("no nodes registered");
    }
    for node in info.nodes {
        println!("{}\t{}\t{}", node.id, node.host_addr, node.server_addr);
    }
    Ok(ExitCode::SUCCESS)
}
