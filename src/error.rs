use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
    /// Bad option value, malformed input file, inconsistent dimensions.
    Config(String),
    IO { why: String, io_error: io::Error },
    /// Singular covariate system, rank-deficient variance-component
    /// system, non-finite ELBO across all grid points.
    Numerical(String),
    /// The per-rank byte budget cannot accommodate the requested layout.
    MemoryBudget(String),
    /// A resume dump is inconsistent with the current inputs.
    ResumeMismatch(String),
    Generic(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(why) => write!(f, "Config error: {}", why),
            Error::IO { why, .. } => write!(f, "IO error: {}", why),
            Error::Numerical(why) => write!(f, "Numerical error: {}", why),
            Error::MemoryBudget(why) => write!(f, "Memory budget error: {}", why),
            Error::ResumeMismatch(why) => write!(f, "Resume mismatch: {}", why),
            Error::Generic(why) => write!(f, "Generic Error: {}", why),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO { why: format!("{}", err), io_error: err }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Error {
        Error::Generic(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Error {
        Error::Generic(format!("bincode::error: {}", *err))
    }
}
