use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("URL `{0}` cannot carry a path")]
    NotABase(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stream closed after {attempts} failed attempts")]
    Exhausted { attempts: u32 },
}
