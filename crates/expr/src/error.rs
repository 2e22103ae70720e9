use crate::Expression;

/// Expression-engine errors. Evaluation errors carry the serialized form of
/// the failing sub-expression so the reporter can show where things went
/// wrong without a stack trace.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expression error in {expr}: {reason}")]
    Eval { expr: String, reason: String },

    #[error("invalid arguments in expression {expr}: {reason}")]
    InvalidArguments { expr: String, reason: String },

    #[error("unknown op {op:?}")]
    UnknownOp { op: String },

    #[error("cannot parse expression from {raw}")]
    Unmarshal { raw: String },

    #[error("invalid JSON path {path:?}: {reason}")]
    Path { path: String, reason: String },
}

impl Error {
    pub fn eval(expr: &Expression, reason: impl std::fmt::Display) -> Self {
        Error::Eval { expr: expr.to_string(), reason: reason.to_string() }
    }

    pub fn invalid_arguments(expr: &Expression, reason: impl std::fmt::Display) -> Self {
        Error::InvalidArguments { expr: expr.to_string(), reason: reason.to_string() }
    }

    pub fn path(path: &str, reason: impl std::fmt::Display) -> Self {
        Error::Path { path: path.to_string(), reason: reason.to_string() }
    }
}
