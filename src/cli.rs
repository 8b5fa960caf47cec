//! CLI argument parsing using clap.

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use serde_json::{Map, Value};

/// Bridge to tools served by a stdio child process.
///
/// Starts the configured tool server, performs the handshake, discovers its
/// capabilities and lets you list or call them.
#[derive(Parser, Debug)]
#[command(name = "toolbridge", version, about, long_about = None)]
pub struct Args {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write logs to a timestamped file under $TMPDIR/toolbridge/logs/
    #[arg(long, global = true)]
    pub log_file: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a .toolbridge.toml in the current directory
    Init,
    /// Start the tool server and list its tools
    Tools {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Call one tool through the validating wrapper and print its text result
    Call {
        /// Tool name
        #[arg(value_name = "TOOL")]
        tool: String,

        /// Argument as key=value; the value is parsed as JSON when possible
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Arguments as a JSON object; --arg entries override its keys
        #[arg(long, value_name = "OBJECT")]
        json: Option<String>,

        #[command(flatten)]
        server: ServerArgs,
    },
}

/// Flags that override the `[server]` and `[timeouts]` sections.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Tool server command line
    #[arg(long, value_name = "CMD", env = "TOOLBRIDGE_SERVER")]
    pub server: Option<String>,

    /// Method dialect: bridge or mcp
    #[arg(long, value_name = "DIALECT")]
    pub dialect: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Build the argument object for `toolbridge call`.
///
/// `--json` supplies the base object; each `key=value` pair is layered on
/// top. Values that parse as JSON keep their type, anything else is a string.
pub fn parse_call_arguments(pairs: &[String], json: Option<&str>) -> Result<Value, String> {
    let mut arguments = match json {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err("--json must be a JSON object".to_string()),
            Err(e) => return Err(format!("invalid --json: {e}")),
        },
        None => Map::new(),
    };

    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(format!("invalid --arg '{pair}': expected KEY=VALUE"));
        };
        if key.is_empty() {
            return Err(format!("invalid --arg '{pair}': empty key"));
        }
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        arguments.insert(key.to_string(), value);
    }

    Ok(Value::Object(arguments))
}
