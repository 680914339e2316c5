use std::fmt;

#[derive(Debug)]
pub enum ReconError {
    /// Engine config validation error (bad tolerance, empty route map, etc.).
    ConfigValidation(String),
    /// The same line type is mapped to more than one route.
    AmbiguousRoute { line_type: String },
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigValidation(msg) => write!(f, "engine config validation error: {msg}"),
            Self::AmbiguousRoute { line_type } => {
                write!(f, "line type '{line_type}' is mapped to both routes")
            }
        }
    }
}

impl std::error::Error for ReconError {}
