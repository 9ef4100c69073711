use std::fmt;
use std::io;

/// The crate's single error type.
///
/// Mirrors the shape of netavark's `NetavarkError`: a small set of variants
/// for conditions callers actually branch on, plus a catch-all `Message`
/// variant built with [`AgentError::wrap`] at every kernel-call boundary so
/// the original cause is never discarded.
#[derive(Debug)]
pub enum AgentError {
    /// A required kernel facility (ipset module, iptables, netlink) is
    /// missing or the process lacks the privilege to use it. Fatal at
    /// startup (§7): the agent must not proceed to the serving state.
    SetUnavailable(String),
    /// A caller supplied a malformed IPv4 address or UID.
    EntryInvalid(String),
    /// Any other failure, wrapping its cause.
    Message {
        msg: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl AgentError {
    pub fn msg(msg: impl Into<String>) -> Self {
        AgentError::Message {
            msg: msg.into(),
            source: None,
        }
    }

    pub fn wrap(msg: impl Into<String>, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        AgentError::Message {
            msg: msg.into(),
            source: Some(source),
        }
    }

    /// True for errors that should abort startup rather than being logged
    /// and absorbed by the reconciler (§7 propagation policy).
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, AgentError::SetUnavailable(_))
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::SetUnavailable(m) => write!(f, "kernel facility unavailable: {m}"),
            AgentError::EntryInvalid(m) => write!(f, "invalid entry: {m}"),
            AgentError::Message { msg, source } => match source {
                Some(s) => write!(f, "{msg}: {s}"),
                None => write!(f, "{msg}"),
            },
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AgentError::Message {
                source: Some(s), ..
            } => Some(s.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for AgentError {
    fn from(e: io::Error) -> Self {
        AgentError::wrap("io error", Box::new(e))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::wrap("json error", Box::new(e))
    }
}

impl From<Box<dyn std::error::Error>> for AgentError {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        AgentError::wrap("kernel command failed", Box::new(StringError(e.to_string())))
    }
}

/// Wraps a plain message as an `Error + Send + Sync`, for converting from
/// non-`Send` boxed errors (e.g. `Box<dyn Error>` returned by the `iptables`
/// crate) into our `Send + Sync` source slot.
#[derive(Debug)]
pub struct StringError(pub String);

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StringError {}

pub type AgentResult<T> = Result<T, AgentError>;

/// Wrap a fallible call with file/command context, same role as the
/// teacher's `fs_err!` macro in `firewall/state.rs`.
#[macro_export]
macro_rules! ctx_err {
    ($result:expr, $msg:expr) => {
        $result.map_err(|err| {
            $crate::error::AgentError::wrap($msg.to_string(), Box::new(err))
        })
    };
}
