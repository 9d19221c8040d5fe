//! HTTP-01 challenge publication.
//!
//! The serving layer answers `/.well-known/acme-challenge/<token>` from the
//! webroot, so every pending challenge is written there as a file. An
//! in-memory index mirrors what has been published so cleanup never misses a
//! token, even when acquisition fails halfway.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::fsutil;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Webroot-relative directory holding challenge files
const CHALLENGE_DIR: &str = ".well-known/acme-challenge";

/// Publishes pending HTTP-01 challenges into the webroot.
///
/// Clones share the same index.
#[derive(Debug, Clone)]
pub struct ChallengeManager {
    dir: PathBuf,
    /// token -> key authorization
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new(webroot: &Path) -> Self {
        Self {
            dir: webroot.join(CHALLENGE_DIR),
            challenges: Arc::new(DashMap::new()),
        }
    }

    /// Directory the serving layer must expose at [`ACME_CHALLENGE_PREFIX`]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish a challenge response
    pub fn add_challenge(&self, token: &str, key_authorization: &str) -> io::Result<()> {
        if !is_safe_token(token) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to publish challenge token '{}'", token),
            ));
        }

        debug!(token = %token, "Publishing HTTP-01 challenge");
        fsutil::write_atomic(&self.dir.join(token), key_authorization.as_bytes(), Some(0o644))?;
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
        Ok(())
    }

    /// Withdraw a completed or abandoned challenge
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_none() {
            return;
        }
        match fs::remove_file(self.dir.join(token)) {
            Ok(()) => debug!(token = %token, "Removed HTTP-01 challenge"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(token = %token, error = %e, "Failed to remove challenge file"),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    /// Withdraw every published challenge
    pub fn clear(&self) {
        let tokens: Vec<String> = self.challenges.iter().map(|e| e.key().clone()).collect();
        for token in &tokens {
            self.remove_challenge(token);
        }
        if !tokens.is_empty() {
            debug!(cleared = tokens.len(), "Cleared pending HTTP-01 challenges");
        }
    }
}

/// Tokens are base64url; anything else could escape the challenge directory
fn is_safe_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
