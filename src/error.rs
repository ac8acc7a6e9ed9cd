use thiserror::Error;

/// Errors surfaced by the public core API. Unknown guest opcodes are not
/// errors; they execute as NOPs.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("ROM image of {len} bytes exceeds the {max} byte limit")]
    RomTooLarge { len: usize, max: usize },

    #[error("failed to map executable memory for the code cache")]
    ExecutableMap(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
