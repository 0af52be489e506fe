//! Authentication boundary
//!
//! MobileShell has exactly one account: whoever knows the shared password.
//! There is no username, no per-project scoping, no multi-tenant token
//! table — a session token is just proof that, at some point, the holder
//! supplied a password whose SHA-256 digest matches a file under
//! `hashed-passwords/`. Sessions are stored only by the digest of the
//! *token*, never the token itself, so a leaked session-store file on disk
//! doesn't hand out live credentials.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SESSION_LIFETIME_HOURS: i64 = 24;
/// A session within this long of expiring is transparently extended on use,
/// so a user actively working never gets logged out mid-session.
const EXTEND_WINDOW_MINUTES: i64 = 30;
const SESSION_COOKIE_NAME: &str = "mobileshell_session";
const MIN_PASSWORD_LENGTH: usize = 36;

pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_token(token: &str) -> String {
    hash_password(token)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    expires_at: DateTime<Utc>,
}

/// Stores the set of accepted password digests and the table of live
/// sessions, both as individual files under `<state-dir>/`, matching the
/// rest of the crate's "state directory is the database" design.
#[derive(Debug, Clone)]
pub struct AuthStore {
    passwords_dir: PathBuf,
    sessions_dir: PathBuf,
}

impl AuthStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            passwords_dir: state_dir.as_ref().join("hashed-passwords"),
            sessions_dir: state_dir.as_ref().join("sessions"),
        }
    }

    /// Validate a candidate password against every registered digest and
    /// register a new password. Returns an error if the password is too
    /// short to be a reasonable shared secret.
    pub fn add_password(&self, password: &str) -> Result<()> {
        anyhow::ensure!(
            password.len() >= MIN_PASSWORD_LENGTH,
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        );

        fs::create_dir_all(&self.passwords_dir).context("creating hashed-passwords directory")?;
        let digest = hash_password(password);
        let path = self.passwords_dir.join(&digest);
        create_zero_byte_file(&path)?;
        set_owner_only_permissions(&path)?;
        Ok(())
    }

    pub fn password_is_valid(&self, password: &str) -> bool {
        let digest = hash_password(password);
        self.passwords_dir.join(&digest).exists()
    }

    pub fn any_password_registered(&self) -> bool {
        fs::read_dir(&self.passwords_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Mint a new session token after a successful password check.
    pub fn create_session(&self) -> Result<String> {
        fs::create_dir_all(&self.sessions_dir).context("creating sessions directory")?;
        let token = Uuid::new_v4().to_string();
        let record = SessionRecord {
            expires_at: Utc::now() + ChronoDuration::hours(SESSION_LIFETIME_HOURS),
        };
        self.write_session(&token, &record)?;
        Ok(token)
    }

    fn session_path(&self, token: &str) -> PathBuf {
        self.sessions_dir.join(hash_token(token))
    }

    fn write_session(&self, token: &str, record: &SessionRecord) -> Result<()> {
        let path = self.session_path(token);
        let contents = serde_json::to_string(record).context("serializing session")?;
        fs::write(&path, contents).context("writing session file")?;
        set_owner_only_permissions(&path)?;
        Ok(())
    }

    /// Validate a token and report its expiry. An invalid or expired token is
    /// reported identically to a missing one (`None`) — no information is
    /// leaked about which case occurred. Does not mutate the session; see
    /// [`Self::extend_session`] for the separate refresh operation.
    pub fn validate_session(&self, token: &str) -> Option<DateTime<Utc>> {
        let path = self.session_path(token);
        let contents = fs::read_to_string(&path).ok()?;
        let record: SessionRecord = serde_json::from_str(&contents).ok()?;

        if record.expires_at <= Utc::now() {
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(record.expires_at)
    }

    pub fn session_is_valid(&self, token: &str) -> bool {
        self.validate_session(token).is_some()
    }

    /// True when a valid token's remaining lifetime has dropped below the
    /// auto-extend threshold.
    pub fn session_needs_extension(&self, token: &str) -> bool {
        match self.validate_session(token) {
            Some(expiry) => expiry - Utc::now() < ChronoDuration::minutes(EXTEND_WINDOW_MINUTES),
            None => false,
        }
    }

    /// Mint a fresh token with a full 24h lifetime for an already-valid
    /// token, without touching the old one: both remain valid until their
    /// own expiries, matching the "extension issues a new token distinct
    /// from the old" invariant. Returns `None` if `token` is not valid.
    pub fn extend_session(&self, token: &str) -> Result<Option<String>> {
        if self.validate_session(token).is_none() {
            return Ok(None);
        }
        self.create_session().map(Some)
    }

    pub fn revoke_session(&self, token: &str) -> Result<()> {
        let path = self.session_path(token);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing session file"),
        }
    }
}

fn create_zero_byte_file(path: &Path) -> Result<()> {
    std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))
        .map(|_| ())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).context("hardening file permissions")
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn session_cookie_name() -> &'static str {
    SESSION_COOKIE_NAME
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn password_round_trips_through_digest_lookup() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let password = "a".repeat(40);
        store.add_password(&password).unwrap();

        assert!(store.password_is_valid(&password));
        assert!(!store.password_is_valid("wrong-password-thats-also-long-enough"));
    }

    #[test]
    fn short_password_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        assert!(store.add_password("too-short").is_err());
    }

    #[test]
    fn session_created_after_password_check_validates() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let token = store.create_session().unwrap();
        assert!(store.validate_session(&token).is_some());
        assert!(store.session_is_valid(&token));
    }

    #[test]
    fn unknown_token_does_not_validate() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        assert!(store.validate_session("not-a-real-token").is_none());
        assert!(!store.session_is_valid("not-a-real-token"));
    }

    #[test]
    fn revoked_session_no_longer_validates() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let token = store.create_session().unwrap();
        store.revoke_session(&token).unwrap();
        assert!(store.validate_session(&token).is_none());
    }

    #[test]
    fn expired_session_is_rejected_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let token = "expired-token".to_string();
        let record = SessionRecord {
            expires_at: Utc::now() - ChronoDuration::minutes(1),
        };
        store.write_session(&token, &record).unwrap();

        assert!(store.validate_session(&token).is_none());
        assert!(!store.session_path(&token).exists());
    }

    #[test]
    fn session_well_within_lifetime_does_not_need_extension() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let token = store.create_session().unwrap();
        assert!(!store.session_needs_extension(&token));
    }

    #[test]
    fn near_expiry_session_needs_extension() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let token = "almost-expired-token".to_string();
        let record = SessionRecord {
            expires_at: Utc::now() + ChronoDuration::minutes(5),
        };
        store.write_session(&token, &record).unwrap();
        assert!(store.session_needs_extension(&token));
    }

    #[test]
    fn extend_session_mints_a_distinct_token_leaving_the_old_one_valid() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        let token = store.create_session().unwrap();

        let new_token = store.extend_session(&token).unwrap().expect("token was valid");

        assert_ne!(token, new_token);
        assert!(store.session_is_valid(&token));
        assert!(store.session_is_valid(&new_token));
    }

    #[test]
    fn extend_session_on_an_invalid_token_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = AuthStore::new(dir.path());
        assert!(store.extend_session("not-a-real-token").unwrap().is_none());
    }
}
