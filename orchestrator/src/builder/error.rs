#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("dockerfile synthesis failed: {0}")]
    Synthesis(String),
    #[error("build driver failed: {0}")]
    Driver(String),
    #[error("build was cancelled")]
    Cancelled,
    #[error("build exceeded its deadline")]
    Timeout,
    #[error("image push failed: {0}")]
    Push(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
