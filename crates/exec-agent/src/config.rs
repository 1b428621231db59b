use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::event_bus::DEFAULT_EVENT_BUFFER;

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub process: ProcessSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Agent name (default: hostname)
    pub name: Option<String>,
    /// Capacity of the in-memory event bus
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSettings {
    /// Shell used to run command lines (`<shell> -c <command line>`)
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Working directory for processes that do not specify one
    pub workdir: Option<String>,
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: None,
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            workdir: None,
        }
    }
}

impl AgentConfig {
    /// Load config from file and environment variables.
    /// Environment variables take precedence over file config.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `EXEC_AGENT_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("EXEC_AGENT_NAME") {
            self.agent.name = Some(name);
        }
        if let Some(buffer) = lookup("EXEC_AGENT_EVENT_BUFFER") {
            match buffer.trim().parse::<usize>() {
                Ok(size) => self.agent.event_buffer = size,
                Err(e) => {
                    tracing::warn!(value = %buffer, error = %e, "ignoring invalid EXEC_AGENT_EVENT_BUFFER")
                }
            }
        }
        if let Some(shell) = lookup("EXEC_AGENT_SHELL") {
            self.process.shell = shell;
        }
        if let Some(workdir) = lookup("EXEC_AGENT_WORKDIR") {
            self.process.workdir = Some(workdir);
        }
    }

    fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".exec-agent/config.toml")
    }

    /// Get agent name, with fallback to hostname
    pub fn agent_name(&self) -> String {
        self.agent.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "exec-agent".to_string())
        })
    }

    pub fn shell(&self) -> &str {
        &self.process.shell
    }

    pub fn workdir(&self) -> Option<&str> {
        self.process.workdir.as_deref()
    }

    /// Event bus capacity, never zero
    pub fn event_buffer(&self) -> usize {
        self.agent.event_buffer.max(1)
    }
}
