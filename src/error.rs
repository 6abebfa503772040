use thiserror::Error;

/// Process exit codes surfaced to the launching harness.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const USER_ABORT: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const DISCOVERY_SYNC: i32 = 3;
    pub const OVERFLOW: i32 = 4;
    pub const RUNTIME: i32 = 5;
}

/// Error kinds of the core, one variant per category of the error design.
/// Transient per-sample conditions are counted, not raised; everything
/// here propagates to the owning broker.
#[derive(Debug, Error)]
pub enum HermesError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("clock sync error: {0}")]
    Sync(String),

    #[error("device error on node {node_id}: {message}")]
    Device { node_id: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage overflow on stream {stream_id}")]
    Overflow { stream_id: String },

    #[error("drain deadline expired with {unflushed} unflushed samples")]
    DrainTimeout { unflushed: u64 },

    #[error("user abort")]
    Aborted,

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl HermesError {
    pub fn exit_code(&self) -> i32 {
        match self {
            HermesError::Config(_) => exit_code::CONFIG,
            HermesError::Discovery(_) | HermesError::Sync(_) => exit_code::DISCOVERY_SYNC,
            HermesError::Overflow { .. } => exit_code::OVERFLOW,
            HermesError::Aborted => exit_code::USER_ABORT,
            // Drain timeout is soft: data loss is reported, the run still
            // counts as a clean stop.
            HermesError::DrainTimeout { .. } => exit_code::CLEAN,
            HermesError::Device { .. } | HermesError::Transport(_) | HermesError::Runtime(_) => {
                exit_code::RUNTIME
            }
        }
    }
}

impl From<std::io::Error> for HermesError {
    fn from(err: std::io::Error) -> Self {
        HermesError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HermesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(HermesError::Config("x".into()).exit_code(), 2);
        assert_eq!(HermesError::Discovery("x".into()).exit_code(), 3);
        assert_eq!(HermesError::Sync("x".into()).exit_code(), 3);
        assert_eq!(HermesError::Overflow { stream_id: "s".into() }.exit_code(), 4);
        assert_eq!(HermesError::Aborted.exit_code(), 1);
        assert_eq!(HermesError::DrainTimeout { unflushed: 10 }.exit_code(), 0);
        assert_eq!(HermesError::Runtime("x".into()).exit_code(), 5);
    }
}
