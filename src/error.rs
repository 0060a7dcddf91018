use thiserror::Error;

/// Errors surfaced by the crate's fallible setup APIs. The session itself
/// reports failures through its transports, not through `Result`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),
}
