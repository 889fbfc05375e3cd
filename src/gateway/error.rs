use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("carrier envelope error: {0}")]
    Carrier(#[from] crate::carrier::Error),
    #[error("service registry error: {0}")]
    Config(#[from] crate::config::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
