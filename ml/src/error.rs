use thiserror::Error;

pub type MlResult<T> = Result<T, MlError>;

/// Recoverable errors of the engine. Misuse at runtime (windows outside a tensor,
/// mismatching depths, unsupported operations) panics at the call site instead.
#[derive(Error, Debug)]
pub enum MlError {
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Unit requires binary input, but the current top stage produces real-valued output")]
    IncompatibleUnits,
    #[error("Numerical degeneration: NaN encountered in {0}")]
    NumericalDegeneration(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Layer could not be (de)serialized:\n {0}.")]
    Persistence(#[from] bincode::Error),
    #[error("Configuration is not valid JSON:\n {0}.")]
    ConfigFormat(#[from] serde_json::Error),
    #[error("Filesystem reported error\n {0}.")]
    Io(#[from] std::io::Error),
}

impl MlError {
    pub(crate) fn shape_mismatch<E, A>(context: &'static str, expected: E, actual: A) -> MlError
    where
        E: std::fmt::Debug,
        A: std::fmt::Debug,
    {
        MlError::ShapeMismatch {
            context,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
