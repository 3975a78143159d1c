use thiserror::Error;

/// Fatal errors raised while reading a heap dump. Any of these means the
/// analysis as a whole is untrustworthy, so callers abort.
#[derive(Error, Debug)]
pub enum HeapError {
    #[error("malformed heap dump at offset {offset}: {detail}")]
    MalformedInput { offset: u64, detail: String },

    #[error("unsupported native id size {0} (expected 4 or 8)")]
    UnsupportedIdSize(u32),

    #[error("heap id {0:#x} exceeds the 36-bit id space")]
    HidOutOfRange(u64),

    #[error("class already defined: {0}")]
    DuplicateClass(String),

    #[error("cannot demangle type name {0:?}")]
    BadTypeName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HeapError {
    pub(crate) fn malformed(offset: u64, detail: impl Into<String>) -> HeapError {
        HeapError::MalformedInput {
            offset,
            detail: detail.into(),
        }
    }
}

/// User-facing errors from the interactive command layer. These are
/// reported to the console and never terminate the session.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("syntax error in command")]
    Syntax,

    #[error("query variable {0} is not defined in the path")]
    UndefinedQueryVar(String),
}
