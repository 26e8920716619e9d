use thiserror::Error;

use crate::types::PinRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Malformed,
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field} `{value}`")]
pub struct InvalidField {
    pub field: &'static str,
    pub value: String,
}

impl InvalidField {
    pub fn new(field: &'static str, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("device name must not be empty")]
    EmptyName,
    #[error("device name longer than {0} characters")]
    NameTooLong(usize),
    #[error("device `{0}` already exists")]
    DuplicateName(String),
    #[error("gpio {0} is already bound to `{1}`")]
    PinInUse(PinRef, String),
    #[error("gpio `{0}` is not in the allow-list")]
    PinNotAllowed(String),
    #[error("device `{0}` is permanent")]
    Permanent(String),
    #[error("no device named `{0}`")]
    UnknownDevice(String),
    #[error("device `{0}` already has a task")]
    TaskExists(String),
    #[error("task index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error(transparent)]
    Malformed(#[from] InvalidField),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io on `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage backend rejected `{key}`: {message}")]
    Backend { key: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("time {hour}:{minute} is out of range")]
    OutOfRange { hour: u32, minute: u32 },
    #[error("real-time clock rejected the value: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("output {pin} unavailable: {reason}")]
    Unavailable { pin: PinRef, reason: String },
    #[error("failed to drive output {pin}: {reason}")]
    Write { pin: PinRef, reason: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Pin(#[from] PinError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(Rejection::Malformed(_)) => ErrorKind::Malformed,
            Self::Rejected(_) => ErrorKind::Validation,
            Self::Storage(_) | Self::Clock(_) | Self::Pin(_) => ErrorKind::Hardware,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

impl From<InvalidField> for SchedulerError {
    fn from(value: InvalidField) -> Self {
        Self::Rejected(Rejection::Malformed(value))
    }
}
