//! Gateway error taxonomy and its mapping to envelope codes and HTTP statuses.

use thiserror::Error;

/// Every failure the gateway reports to a caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A session with this name is already registered (or still running).
    #[error("{0}")]
    Conflict(String),

    /// Unknown session, unresolved method, missing settings file.
    #[error("{0}")]
    NotFound(String),

    /// Session omitted while more than one is registered.
    #[error("multiple sessions available, specify which one to use")]
    Ambiguous,

    /// Dispatch path with zero or more than three segments.
    #[error("incorrect method format: {0:?}")]
    MalformedPath(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Failure surfaced by the messaging client itself.
    #[error("{message}")]
    Upstream { code: i64, message: String },

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Health check failure; never rendered into an envelope.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

impl GatewayError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn upstream(code: i64, message: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Application code carried in the envelope's `errors[].code`.
    pub fn code(&self) -> i64 {
        match self {
            Self::Conflict(_) => 409,
            Self::NotFound(_) => 404,
            Self::Ambiguous | Self::MalformedPath(_) | Self::InvalidParams(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Upstream { code, .. } => *code,
            Self::Settings(_) | Self::Io { .. } | Self::Fatal(_) => 500,
        }
    }

    /// HTTP status: the code itself when it is a 4xx, otherwise 400.
    pub fn status(&self) -> u16 {
        let code = self.code();
        if (400..=499).contains(&code) {
            code as u16
        } else {
            400
        }
    }

    /// Stable name of the error class, exposed in the envelope's diagnostic block.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "Conflict",
            Self::NotFound(_) => "NotFound",
            Self::Ambiguous => "Ambiguous",
            Self::MalformedPath(_) => "MalformedPath",
            Self::InvalidParams(_) => "InvalidParams",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Upstream { .. } => "Upstream",
            Self::Settings(_) => "Settings",
            Self::Io { .. } => "Io",
            Self::Fatal(_) => "Fatal",
        }
    }

    /// Expected, caller-caused failures. Logged without diagnostics.
    pub fn is_notice(&self) -> bool {
        match self {
            Self::Conflict(_)
            | Self::NotFound(_)
            | Self::Ambiguous
            | Self::MalformedPath(_)
            | Self::InvalidParams(_)
            | Self::Unauthorized(_) => true,
            Self::Upstream { code, .. } => (400..=499).contains(code),
            Self::Settings(_) | Self::Io { .. } | Self::Fatal(_) => false,
        }
    }

    /// Source chain rendered as `outer: inner: ...`, empty when there is no nested cause.
    pub fn cause_chain(&self) -> String {
        let mut out = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push(err.to_string());
            source = err.source();
        }
        out.join(": ")
    }
}
