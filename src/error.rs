// COREWARDEN ERRORS
// EVERY FAILURE HERE IS RECOVERABLE: REJECTED INPUT, OR "STAY DISABLED".

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown tunable: {0}")]
    UnknownTunable(String),

    #[error("invalid value {input:?} for {name}: expected an unsigned integer")]
    Parse { name: String, input: String },

    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name: String,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("failed to spawn {name} worker: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
