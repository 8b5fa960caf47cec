//! Resolved runtime configuration: CLI flags over `.toolbridge.toml` over defaults.

use anyhow::{anyhow, bail, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{ClientOptions, Dialect, LaunchSpec, SearchPath, Session};
use crate::cli::ServerArgs;
use crate::project::{BridgeConfig, ProjectConfig};
use crate::schema::ToolSet;
use crate::tool_loop::{ModelCollaborator, ToolLoop};

#[derive(Debug, Clone)]
pub struct Config {
    /// How to launch the tool server.
    pub launch: LaunchSpec,
    /// Dialect and timeouts for the protocol client.
    pub client: ClientOptions,
    /// Round-trip bound for each tool-loop turn.
    pub max_round_trips: usize,
    /// Directory injected into the search-path variable; also the child's cwd.
    pub project_root: PathBuf,
}

impl Config {
    /// Build config from CLI overrides and an optional discovered project.
    ///
    /// Without a project the current directory acts as project root.
    pub fn from_args(server: &ServerArgs, project: Option<ProjectConfig>) -> Result<Self> {
        let (root, file) = match project {
            Some(project) => (project.root, project.config),
            None => (env::current_dir()?, BridgeConfig::default()),
        };

        let command = server
            .server
            .clone()
            .or(file.server.command)
            .ok_or_else(|| {
                anyhow!("no tool server command: set [server] command in .toolbridge.toml or pass --server")
            })?;
        let (program, args) = parse_server_command(&command)?;

        let dialect = match &server.dialect {
            Some(name) => parse_dialect(name)?,
            None => file.server.dialect,
        };

        let request_secs = server.timeout.unwrap_or(file.timeouts.request_secs);
        if request_secs == 0 || file.timeouts.init_secs == 0 {
            bail!("timeouts must be at least 1 second");
        }
        if file.tool_loop.max_round_trips == 0 {
            bail!("[loop] max_round_trips must be at least 1");
        }

        let project_root = match file.server.project_root {
            Some(path) if path.is_relative() => root.join(path),
            Some(path) => path,
            None => root,
        };

        let mut launch = LaunchSpec::new(program, args);
        launch.env = file.server.env.into_iter().collect();
        launch.search_path = Some(SearchPath {
            var: file.server.search_path_var,
            entry: project_root.clone(),
        });
        launch.cwd = Some(project_root.clone());

        Ok(Config {
            launch,
            client: ClientOptions {
                dialect,
                init_timeout: Duration::from_secs(file.timeouts.init_secs),
                request_timeout: Duration::from_secs(request_secs),
                shutdown_timeout: Duration::from_secs(file.timeouts.shutdown_secs),
            },
            max_round_trips: file.tool_loop.max_round_trips,
            project_root,
        })
    }

    /// A fresh, unstarted session for this configuration.
    pub fn session(&self) -> Session {
        Session::new(self.launch.clone(), self.client.clone())
    }

    /// A tool loop over `tools` with the configured round-trip bound.
    pub fn tool_loop(&self, model: Arc<dyn ModelCollaborator>, tools: ToolSet) -> ToolLoop {
        ToolLoop::new(model, tools, self.max_round_trips)
    }
}

/// Shell-split a server command line into program and arguments.
pub fn parse_server_command(command: &str) -> Result<(String, Vec<String>)> {
    let parts = shlex::split(command)
        .ok_or_else(|| anyhow!("invalid server command: failed to parse \"{}\"", command))?;
    let mut iter = parts.into_iter();
    let Some(program) = iter.next() else {
        bail!("server command is empty");
    };
    Ok((program, iter.collect()))
}

/// Parse a dialect name as accepted by `--dialect`.
pub fn parse_dialect(name: &str) -> Result<Dialect> {
    match name {
        "bridge" => Ok(Dialect::Bridge),
        "mcp" => Ok(Dialect::Mcp),
        _ => bail!("invalid dialect '{}': must be one of bridge, mcp", name),
    }
}
