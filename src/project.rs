//! Project configuration discovery and loading.
//!
//! A toolbridge project is defined by a `.toolbridge.toml` file at the
//! project root. This module walks up the directory tree to find it, parses
//! it, and writes a commented default file on `toolbridge init`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::bridge::Dialect;

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = ".toolbridge.toml";

/// Project configuration loaded from `.toolbridge.toml`.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    /// The directory containing `.toolbridge.toml`.
    pub root: PathBuf,
    /// The parsed configuration.
    pub config: BridgeConfig,
}

/// Contents of `.toolbridge.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default, rename = "loop")]
    pub tool_loop: LoopConfig,
}

/// `[server]` section: how to launch the tool server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Shell-style command line, e.g. `python -m src.server`.
    pub command: Option<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Variable that receives the project root as a leading search-path entry.
    #[serde(default = "default_search_path_var")]
    pub search_path_var: String,
    /// Overrides the project root injected into `search_path_var`.
    pub project_root: Option<PathBuf>,
    #[serde(default)]
    pub dialect: Dialect,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: None,
            env: BTreeMap::new(),
            search_path_var: default_search_path_var(),
            project_root: None,
            dialect: Dialect::default(),
        }
    }
}

/// `[timeouts]` section, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_init_secs")]
    pub init_secs: u64,
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_secs: default_init_secs(),
            request_secs: default_request_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

/// `[loop]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_round_trips")]
    pub max_round_trips: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_round_trips: default_max_round_trips(),
        }
    }
}

fn default_search_path_var() -> String {
    "PYTHONPATH".to_string()
}

fn default_init_secs() -> u64 {
    30
}

fn default_request_secs() -> u64 {
    60
}

fn default_shutdown_secs() -> u64 {
    5
}

fn default_max_round_trips() -> usize {
    crate::tool_loop::DEFAULT_MAX_ROUND_TRIPS
}

/// Discover the project configuration by walking up from CWD.
///
/// Returns an error if no `.toolbridge.toml` is found, instructing the user
/// to run `toolbridge init`.
pub fn discover() -> Result<ProjectConfig> {
    let cwd = env::current_dir()?;
    discover_from(&cwd)
}

/// Discover the project configuration starting from a specific directory.
pub fn discover_from(start: &Path) -> Result<ProjectConfig> {
    let mut current = start;

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.is_file() {
            let config = load_config(&config_path)?;
            return Ok(ProjectConfig {
                root: current.to_path_buf(),
                config,
            });
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => {
                bail!("No {CONFIG_FILE} found. Run 'toolbridge init' to create one.")
            }
        }
    }
}

/// Load and parse a `.toolbridge.toml` file.
fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: BridgeConfig =
        toml::from_str(&content).with_context(|| format!("Invalid {}", path.display()))?;
    Ok(config)
}

/// Initialize a toolbridge project in the current directory.
///
/// Idempotent: an existing `.toolbridge.toml` is left untouched.
pub fn init() -> Result<()> {
    let cwd = env::current_dir()?;
    init_in_dir(&cwd)
}

fn init_in_dir(cwd: &Path) -> Result<()> {
    let config_path = cwd.join(CONFIG_FILE);
    if config_path.exists() {
        println!("{CONFIG_FILE} already exists, skipping.");
        return Ok(());
    }

    let default_config = r#"[server]
# command = "python -m src.server"
# env = { API_KEY = "..." }
# search_path_var = "PYTHONPATH"
# dialect = "bridge"   # or "mcp"

[timeouts]
# init_secs = 30
# request_secs = 60
# shutdown_secs = 5

[loop]
# max_round_trips = 8
"#;
    fs::write(&config_path, default_config)
        .with_context(|| format!("Failed to create {CONFIG_FILE}"))?;
    println!("Created {CONFIG_FILE}");
    println!("Next steps:");
    println!("  - Set [server] command to the tool server launch command");
    println!("  - Run 'toolbridge tools' to list its capabilities");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_project(toml_content: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join(CONFIG_FILE), toml_content).unwrap();
        (dir, root)
    }

    #[test]
    fn discovers_config_in_cwd() {
        let (_tmp, root) = temp_project("[server]\ncommand = \"python -m src.server\"");
        let result = discover_from(&root).unwrap();
        assert_eq!(result.root, root);
        assert_eq!(
            result.config.server.command.as_deref(),
            Some("python -m src.server")
        );
    }

    #[test]
    fn discovers_config_two_directories_up() {
        let (_tmp, root) = temp_project("[loop]\nmax_round_trips = 3");
        let subdir = root.join("a").join("b");
        fs::create_dir_all(&subdir).unwrap();

        let result = discover_from(&subdir).unwrap();
        assert_eq!(result.root, root);
        assert_eq!(result.config.tool_loop.max_round_trips, 3);
    }

    #[test]
    fn no_config_returns_error_with_init_message() {
        let tmp = TempDir::new().unwrap();
        let err_msg = discover_from(tmp.path()).unwrap_err().to_string();
        assert!(
            err_msg.contains("toolbridge init"),
            "Error should mention 'toolbridge init', got: {}",
            err_msg
        );
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let (_tmp, root) = temp_project("");
        let config = discover_from(&root).unwrap().config;
        assert_eq!(config.server.command, None);
        assert_eq!(config.server.search_path_var, "PYTHONPATH");
        assert_eq!(config.server.dialect, Dialect::Bridge);
        assert_eq!(config.timeouts.init_secs, 30);
        assert_eq!(config.timeouts.request_secs, 60);
        assert_eq!(config.timeouts.shutdown_secs, 5);
        assert_eq!(config.tool_loop.max_round_trips, 8);
    }

    #[test]
    fn full_config_parses() {
        let (_tmp, root) = temp_project(
            r#"
[server]
command = "uv run server.py"
env = { SERPAPI_KEY = "secret", MODE = "test" }
search_path_var = "NODE_PATH"
project_root = "/srv/app"
dialect = "mcp"

[timeouts]
request_secs = 10
"#,
        );
        let config = discover_from(&root).unwrap().config;
        assert_eq!(config.server.env.get("SERPAPI_KEY").unwrap(), "secret");
        assert_eq!(config.server.env.len(), 2);
        assert_eq!(config.server.search_path_var, "NODE_PATH");
        assert_eq!(
            config.server.project_root,
            Some(PathBuf::from("/srv/app"))
        );
        assert_eq!(config.server.dialect, Dialect::Mcp);
        assert_eq!(config.timeouts.request_secs, 10);
        assert_eq!(config.timeouts.init_secs, 30);
    }

    #[test]
    fn invalid_toml_returns_error() {
        let (_tmp, root) = temp_project("[server\ncommand = 1");
        assert!(discover_from(&root).is_err());
    }

    #[test]
    fn unknown_dialect_is_rejected() {
        let (_tmp, root) = temp_project("[server]\ndialect = \"grpc\"");
        assert!(discover_from(&root).is_err());
    }

    #[test]
    fn unknown_keys_ignored_for_forward_compat() {
        let (_tmp, root) = temp_project("[foo]\nbar = 1\n[loop]\nmax_round_trips = 4");
        let config = discover_from(&root).unwrap().config;
        assert_eq!(config.tool_loop.max_round_trips, 4);
    }

    #[test]
    fn init_creates_parseable_config() {
        let tmp = TempDir::new().unwrap();
        init_in_dir(tmp.path()).unwrap();

        let config_path = tmp.path().join(CONFIG_FILE);
        assert!(config_path.exists());
        let config = load_config(&config_path).unwrap();
        assert_eq!(config.tool_loop.max_round_trips, 8);
    }

    #[test]
    fn init_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE),
            "[server]\ncommand = \"custom\"\n",
        )
        .unwrap();

        init_in_dir(tmp.path()).unwrap();
        let content = fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(content, "[server]\ncommand = \"custom\"\n");
    }
}
