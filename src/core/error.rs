use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    /// A page header, varint, offset or structure invariant is violated.
    /// Never auto-recovered; the caller is expected to abandon the cursor.
    Corrupt,
    /// Segment-id space or segment count exhausted.
    Full,
    Config,
    Query,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn corrupt(context: &str) -> Self {
        Error::new(ErrorKind::Corrupt, context.to_string())
    }

    pub fn config(context: String) -> Self {
        Error::new(ErrorKind::Config, context)
    }

    pub fn query(context: String) -> Self {
        Error::new(ErrorKind::Query, context)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Corrupt,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
