use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidSelector,
    OfflineTarget,
    AmbiguousLaunch,
    SessionNotFound,
    AmbiguousSession,
    PreconditionFailed,
    RemoteTimeout,
    RemoteFailure,
    Usage,
    Other,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::InvalidSelector => "invalid selector",
            ErrorKind::OfflineTarget => "offline target",
            ErrorKind::AmbiguousLaunch => "ambiguous launch",
            ErrorKind::SessionNotFound => "session not found",
            ErrorKind::AmbiguousSession => "ambiguous session",
            ErrorKind::PreconditionFailed => "precondition failed",
            ErrorKind::RemoteTimeout => "remote timeout",
            ErrorKind::RemoteFailure => "remote failure",
            ErrorKind::Usage => "usage",
            ErrorKind::Other => "error",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn usage<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Usage, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Operator-facing rendering used by the dispatcher boundary.
    pub fn report(&self) -> String {
        format!("error ({}): {}", self.kind.label(), self.msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
