//! Toolbridge - list and call tools served by a stdio child process

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use std::process::ExitCode;

use toolbridge::bridge::Session;
use toolbridge::cli::{self, ServerArgs};
use toolbridge::config::Config;
use toolbridge::output::{formatter, logger};
use toolbridge::project;
use toolbridge::schema::ToolSet;
use toolbridge::BridgeError;

/// Exit code for tool-level failures (validation, remote handler error, unknown tool).
const EXIT_TOOL_FAILURE: u8 = 2;

fn main() -> ExitCode {
    match run() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = cli::Args::parse_args();
    if let Some(path) = logger::init(args.verbose, args.log_file)? {
        eprintln!("Logging to {}", path.display());
    }

    match args.command {
        Some(cli::Command::Init) => {
            project::init()?;
            Ok(ExitCode::SUCCESS)
        }
        Some(cli::Command::Tools { server }) => runtime()?.block_on(list_tools(&server)),
        Some(cli::Command::Call {
            tool,
            args,
            json,
            server,
        }) => {
            let arguments = cli::parse_call_arguments(&args, json.as_deref()).map_err(|e| anyhow!(e))?;
            runtime()?.block_on(call_tool(&server, &tool, arguments))
        }
        None => {
            // Bare `toolbridge` with no subcommand prints help
            cli::Args::parse_from(["toolbridge", "--help"]);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")
}

/// Resolve config; a `--server` flag makes `.toolbridge.toml` optional.
fn load_config(server: &ServerArgs) -> Result<Config> {
    let project = match project::discover() {
        Ok(project) => Some(project),
        Err(e) if server.server.is_some() => {
            tracing::debug!(error = %e, "no project config, using command line only");
            None
        }
        Err(e) => return Err(e),
    };
    Config::from_args(server, project)
}

async fn list_tools(server: &ServerArgs) -> Result<ExitCode> {
    let config = load_config(server)?;
    let mut session = config.session();
    let outcome = discover(&mut session).await;
    session.stop().await;

    formatter::print_tools(&outcome?);
    Ok(ExitCode::SUCCESS)
}

async fn call_tool(server: &ServerArgs, tool: &str, arguments: Value) -> Result<ExitCode> {
    let config = load_config(server)?;
    let mut session = config.session();
    let outcome = call_once(&mut session, tool, arguments).await;
    session.stop().await;

    match outcome {
        Ok(text) => {
            formatter::print_result(&text);
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ (BridgeError::ToolExecution { .. } | BridgeError::Validation { .. })) => {
            formatter::print_tool_error(tool, &e);
            Ok(ExitCode::from(EXIT_TOOL_FAILURE))
        }
        Err(e) => Err(e.into()),
    }
}

async fn discover(session: &mut Session) -> toolbridge::Result<ToolSet> {
    session.start().await?;
    session.tools().await
}

async fn call_once(session: &mut Session, name: &str, arguments: Value) -> toolbridge::Result<String> {
    let tools = discover(session).await?;
    let Some(tool) = tools.get(name) else {
        let known: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        return Err(BridgeError::ToolExecution {
            tool: name.to_string(),
            message: format!("unknown tool; available tools: {}", known.join(", ")),
        });
    };
    formatter::print_call(name, &arguments);
    tool.call(arguments).await
}
