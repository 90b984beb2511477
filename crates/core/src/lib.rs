#![forbid(unsafe_code)]

pub mod clock;
pub mod history;
pub mod idlist;
pub mod model;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use model::{
    ActivationEntry, HeartbeatField, PeerDocument, PeerIdentity, STALE_AFTER_MS, SelectionItem,
};

pub mod ids {
    use serde::{Deserialize, Serialize};

    const MAX_SESSION_ID_LEN: usize = 128;
    const MAX_HOST_PART_LEN: usize = 64;

    /// Identity of one running peer process, stable for the lifetime of that process.
    #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct SessionId(String);

    impl SessionId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, SessionIdError> {
            let value = value.into();
            validate_session_id(&value)?;
            Ok(Self(value))
        }

        /// Builds `<host>-<pid>`; the host part is folded to `[a-z0-9.-]`.
        pub fn for_process(hostname: &str, pid: u32) -> Self {
            let mut host = String::with_capacity(hostname.len().min(MAX_HOST_PART_LEN));
            for ch in hostname.trim().chars() {
                if host.len() >= MAX_HOST_PART_LEN {
                    break;
                }
                if ch.is_ascii_alphanumeric() || ch == '.' {
                    host.push(ch.to_ascii_lowercase());
                } else {
                    host.push('-');
                }
            }
            let host = host.trim_matches(|c| c == '-' || c == '.');
            let host = if host.is_empty() { "host" } else { host };
            Self(format!("{host}-{pid}"))
        }
    }

    impl std::fmt::Display for SessionId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl TryFrom<String> for SessionId {
        type Error = SessionIdError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::try_new(value)
        }
    }

    impl From<SessionId> for String {
        fn from(value: SessionId) -> Self {
            value.0
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum SessionIdError {
        Empty,
        TooLong,
        InvalidFirstChar,
        InvalidChar { ch: char, index: usize },
    }

    impl std::fmt::Display for SessionIdError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Empty => write!(f, "session id must not be empty"),
                Self::TooLong => write!(f, "session id is too long"),
                Self::InvalidFirstChar => write!(f, "session id must start with [A-Za-z0-9]"),
                Self::InvalidChar { ch, index } => {
                    write!(f, "session id has invalid char {ch:?} at {index}")
                }
            }
        }
    }

    impl std::error::Error for SessionIdError {}

    fn validate_session_id(value: &str) -> Result<(), SessionIdError> {
        if value.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if value.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong);
        }
        let mut chars = value.chars();
        let Some(first) = chars.next() else {
            return Err(SessionIdError::Empty);
        };
        if !first.is_ascii_alphanumeric() {
            return Err(SessionIdError::InvalidFirstChar);
        }
        for (index, ch) in value.chars().enumerate() {
            if index == 0 {
                continue;
            }
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':' | '@') {
                continue;
            }
            return Err(SessionIdError::InvalidChar { ch, index });
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn session_id_validation() {
            assert_eq!(SessionId::try_new("").unwrap_err(), SessionIdError::Empty);
            assert_eq!(
                SessionId::try_new("-abc").unwrap_err(),
                SessionIdError::InvalidFirstChar
            );
            assert_eq!(
                SessionId::try_new("ab c").unwrap_err(),
                SessionIdError::InvalidChar { ch: ' ', index: 2 }
            );
            assert_eq!(
                SessionId::try_new("x".repeat(129)).unwrap_err(),
                SessionIdError::TooLong
            );
            assert!(SessionId::try_new("ws-01.lan-4120").is_ok());
        }

        #[test]
        fn for_process_folds_hostname() {
            let id = SessionId::for_process("  My Box_01 ", 4120);
            assert_eq!(id.as_str(), "my-box-01-4120");
            assert!(SessionId::try_new(id.as_str()).is_ok());

            let id = SessionId::for_process("", 7);
            assert_eq!(id.as_str(), "host-7");
        }
    }
}
