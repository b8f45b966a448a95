use std::io;

use thiserror::Error;

/// Errors that can escape the core crate's public API.
///
/// Failures that happen *during* a single query's rule evaluation never
/// surface as an `Error` — matcher/action errors are logged and folded
/// into `Continue`/non-match per §7 of the spec. This enum is for the
/// things that do propagate: parsing a policy command, loading a
/// rulefile or hosts file, and fake-IP pool construction.
#[derive(Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("reference error: {0}")]
    Reference(String),

    #[error("invalid cidr: {0}")]
    InvalidCidr(#[from] ipnet::AddrParseError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("fake-ip pool exhausted for {0}")]
    PoolExhausted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
