use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use finproj::api::{self, AppState, Cli, Command, Operation, RequestArgs, ScenarioFlags};
use finproj::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    config.logging.init();
    let tables = config.load_tables().context("loading tables")?;

    let (operation, request, flags) = match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            api::run_http_server(&config, tables)
                .await
                .context("HTTP server failed")?;
            return Ok(());
        }
        Command::Project(cmd) => (Operation::Project, cmd.request, Some(cmd.flags)),
        Command::Simulate(cmd) => (Operation::Simulate, cmd.request, Some(cmd.flags)),
        Command::Strategies(args) => (Operation::Strategies, args, None),
        Command::Allocate(args) => (Operation::Allocate, args, None),
        Command::Withholding(args) => (Operation::Withholding, args, None),
        Command::OptimizeWithholding(args) => (Operation::OptimizeWithholding, args, None),
        Command::RetirementOptions(args) => (Operation::RetirementOptions, args, None),
    };

    let body = read_request(&request)?;
    let state = AppState::new(tables, config.limits);
    let response = run_one_shot(operation, &body, flags.as_ref(), &state)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn run_one_shot(
    operation: Operation,
    body: &str,
    flags: Option<&ScenarioFlags>,
    state: &AppState,
) -> Result<serde_json::Value> {
    api::execute(operation, body, flags, state).with_context(|| format!("{operation:?} failed"))
}

fn read_request(args: &RequestArgs) -> Result<String> {
    match &args.input {
        Some(path) => read_file(path),
        // Flags alone are enough for project/simulate at an interactive prompt.
        None if io::stdin().is_terminal() => Ok(String::new()),
        None => {
            let mut body = String::new();
            io::stdin()
                .read_to_string(&mut body)
                .context("reading request from stdin")?;
            Ok(body)
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}
