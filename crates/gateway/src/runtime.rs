#![forbid(unsafe_code)]

//! Per-user runtime directory holding each live gateway's token and endpoint files.
//!
//! ```text
//! <runtime_dir>/tokens/<session>.token      plaintext, 0600, rotated on every start
//! <runtime_dir>/endpoints/<session>.json    {session_id, hostname, port, pid, tls, started_at_ms}
//! ```

use crate::GatewayError;
use peerlink_core::ids::SessionId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const RUNTIME_DIR_ENV: &str = "PEERLINK_RUNTIME_DIR";
const DEFAULT_DIR_NAME: &str = "peerlink";
const TOKENS_SUBDIR: &str = "tokens";
const ENDPOINTS_SUBDIR: &str = "endpoints";
const TOKEN_BYTES: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub session_id: SessionId,
    pub hostname: String,
    pub port: u16,
    pub pid: u32,
    pub tls: bool,
    pub started_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeDir {
    root: PathBuf,
}

impl RuntimeDir {
    /// First usable candidate: the override, `$XDG_RUNTIME_DIR/peerlink`,
    /// `/run/user/<uid>/peerlink`, then `<tmp>/peerlink`. The chosen directory is created
    /// private to the current user.
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self, GatewayError> {
        let candidates = runtime_dir_candidates(override_dir);
        for dir in &candidates {
            if dir.as_os_str().is_empty() {
                continue;
            }
            if ensure_private_dir(dir) {
                return Ok(Self { root: dir.clone() });
            }
            tracing::debug!(dir = %dir.display(), "runtime dir candidate unusable");
        }
        Err(GatewayError::Config(format!(
            "no usable runtime directory among {} candidates",
            candidates.len()
        )))
    }

    /// Uses `root` as is; directories are created on first write.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join(TOKENS_SUBDIR)
            .join(format!("{}.token", file_stem(session_id)))
    }

    pub fn endpoint_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join(ENDPOINTS_SUBDIR)
            .join(format!("{}.json", file_stem(session_id)))
    }

    pub fn write_token(&self, session_id: &SessionId, token: &str) -> Result<PathBuf, GatewayError> {
        let path = self.token_path(session_id);
        write_private_atomic(&path, token.as_bytes())?;
        Ok(path)
    }

    pub fn read_token(&self, session_id: &SessionId) -> Option<String> {
        let text = std::fs::read_to_string(self.token_path(session_id)).ok()?;
        let token = text.trim();
        (!token.is_empty()).then(|| token.to_string())
    }

    pub fn write_endpoint(&self, info: &EndpointInfo) -> Result<PathBuf, GatewayError> {
        let path = self.endpoint_path(&info.session_id);
        let text = serde_json::to_vec(info).map_err(|err| GatewayError::Protocol(err.to_string()))?;
        write_private_atomic(&path, &text)?;
        Ok(path)
    }

    pub fn read_endpoint(&self, session_id: &SessionId) -> Option<EndpointInfo> {
        let text = std::fs::read_to_string(self.endpoint_path(session_id)).ok()?;
        let info = serde_json::from_str::<EndpointInfo>(&text).ok()?;
        (info.session_id == *session_id).then_some(info)
    }

    pub fn remove_session_files(&self, session_id: &SessionId) {
        for path in [self.token_path(session_id), self.endpoint_path(session_id)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove runtime file");
                }
            }
        }
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compares digests instead of the raw strings so timing does not depend on where the
/// presented token first differs.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.trim().as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn runtime_dir_candidates(override_dir: Option<&Path>) -> Vec<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
        return vec![dir.to_path_buf()];
    }
    if let Some(dir) = runtime_dir_from_env() {
        return vec![dir];
    }
    let mut dirs = Vec::new();
    if let Some(dir) = runtime_dir_from_xdg_env() {
        dirs.push(dir);
    }
    #[cfg(unix)]
    {
        if let Some(dir) = runtime_dir_from_run_user() {
            dirs.push(dir);
        }
    }
    dirs.push(std::env::temp_dir().join(DEFAULT_DIR_NAME));
    dedup_dirs(dirs)
}

fn runtime_dir_from_env() -> Option<PathBuf> {
    std::env::var(RUNTIME_DIR_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn runtime_dir_from_xdg_env() -> Option<PathBuf> {
    std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(v).join(DEFAULT_DIR_NAME))
}

#[cfg(unix)]
fn runtime_dir_from_run_user() -> Option<PathBuf> {
    let uid = uid_from_proc_status()?;
    let base = PathBuf::from("/run/user").join(uid.to_string());
    if !base.is_dir() {
        return None;
    }
    Some(base.join(DEFAULT_DIR_NAME))
}

#[cfg(unix)]
fn uid_from_proc_status() -> Option<u32> {
    let text = std::fs::read_to_string("/proc/self/status").ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse::<u32>().ok())
}

fn dedup_dirs(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::<PathBuf>::new();
    dirs.into_iter().filter(|dir| seen.insert(dir.clone())).collect()
}

fn ensure_private_dir(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    }
    true
}

/// Session ids may contain `:` and `@`, which some filesystems reject.
fn file_stem(session_id: &SessionId) -> String {
    session_id
        .as_str()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn write_private_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(tmp, path)
}
