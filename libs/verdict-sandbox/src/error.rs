use thiserror::Error;

/// Failures inside the pipeline that are not a classified outcome of the
/// submitted program. All of them end up as an internal-error verdict.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The isolation tool ran but reported a failure
    #[error("isolate {operation} failed for slot {slot}: {message}")]
    Tool {
        operation: &'static str,
        slot: u32,
        message: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid resource limit {name}: {reason}")]
    InvalidLimit { name: &'static str, reason: String },

    #[error("invalid slot configuration: {0}")]
    InvalidSlots(String),

    #[error("no sandbox slot available: {0}")]
    SlotUnavailable(String),

    #[error("run command for language '{0}' is empty")]
    EmptyCommand(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SandboxError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
