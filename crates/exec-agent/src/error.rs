use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("command line is empty")]
    EmptyCommandLine,

    #[error("workdir does not exist: {0}")]
    WorkdirNotFound(String),

    #[error("failed to spawn `{command_line}`: {source}")]
    Spawn {
        command_line: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process not found: pid={0}")]
    ProcessNotFound(u64),

    #[error("process is not alive: pid={0}")]
    ProcessNotAlive(u64),
}
