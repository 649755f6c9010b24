use std::{error::Error, fmt, io, path::PathBuf};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training pipeline failures.
#[derive(Debug)]
pub enum TrainErr {
    Io(io::Error),
    /// A configuration field or file that cannot be accepted as given.
    Config {
        what: String,
    },
    /// A checkpoint filename that does not follow the
    /// `iteration-<digits>-epoch-<digits>.ckpt` convention.
    CkptName {
        name: String,
    },
    /// A checkpoint payload that is present but unreadable.
    Ckpt {
        path: PathBuf,
        what: String,
    },
    /// Two aggregates that must agree on a dimension but do not.
    Shape {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Config { what } => write!(f, "invalid configuration: {what}"),
            TrainErr::CkptName { name } => {
                write!(
                    f,
                    "checkpoint filename {name:?} does not match iteration-<digits>-epoch-<digits>.ckpt"
                )
            }
            TrainErr::Ckpt { path, what } => {
                write!(f, "unreadable checkpoint {}: {what}", path.display())
            }
            TrainErr::Shape {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch between {a} and {b}: got {got}, expected {expected}"
            ),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<csv::Error> for TrainErr {
    fn from(value: csv::Error) -> Self {
        match value.into_kind() {
            csv::ErrorKind::Io(e) => Self::Io(e),
            other => Self::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("csv error: {other:?}"),
            )),
        }
    }
}
