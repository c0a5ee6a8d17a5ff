//! Server configuration.
//!
//! Values come from the environment with CLI overrides layered on top in
//! `main.rs`. Workers receive a separately sanitized environment built by
//! the launcher; this struct only configures the server process itself.

use std::path::PathBuf;

pub const DEFAULT_BACKEND_PORT: u16 = 8002;

/// Configuration for the trigger server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the HTTP + WebSocket listener (`BACKEND_PORT`).
    pub port: u16,
    /// SQLite database location.
    pub db_path: PathBuf,
    /// Repository root workers are launched from.
    pub repo_root: PathBuf,
    /// Workflow output tree: `agents/<adw_id>/...`.
    pub agents_dir: PathBuf,
    /// Shared spec directory, sibling of `agents/`.
    pub specs_dir: PathBuf,
    /// `.env` file whose contents seed the sanitized worker environment.
    pub env_file: PathBuf,
    /// Database-only storage (`ADW_DB_ONLY`, default true). When false the
    /// store mirrors each workflow record to `agents/<adw_id>/adw_state.json`.
    pub db_only: bool,
    /// GitHub token forwarded to workers as `GH_TOKEN`.
    pub github_pat: Option<String>,
    /// Permissive CORS for local UI development.
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_BACKEND_PORT,
            db_path: PathBuf::from(".adwd/adwd.db"),
            repo_root: PathBuf::from("."),
            agents_dir: PathBuf::from("agents"),
            specs_dir: PathBuf::from("specs"),
            env_file: PathBuf::from(".env"),
            db_only: true,
            github_pat: None,
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("BACKEND_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.port = port;
        }
        if let Ok(db_only) = std::env::var("ADW_DB_ONLY") {
            config.db_only = db_only.to_lowercase() != "false";
        }
        if let Ok(pat) = std::env::var("GITHUB_PAT")
            && !pat.is_empty()
        {
            config.github_pat = Some(pat);
        }

        config
    }
}
