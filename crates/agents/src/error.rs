/// Tool registration failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid tool name '{name}': {reason}")]
    InvalidToolName { name: String, reason: &'static str },
    #[error("tool '{name}' has an invalid parameter schema: {reason}")]
    InvalidToolSchema { name: String, reason: &'static str },
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

pub type Result<T> = std::result::Result<T, Error>;
