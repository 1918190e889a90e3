use crate::error::TillError;
use crate::session::SessionRecord;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::warn;
use zeroize::Zeroizing;

const SESSION_MAGIC: &[u8; 8] = b"TILLSES1";
const SESSION_FILE: &str = "session.till";

/// At-rest store for the single cached session record.
///
/// The record is MessagePack-encoded and AES-256-GCM-encrypted before it is
/// written; plaintext session data never touches durable storage. Anything
/// unreadable on the way back (missing key material, truncation, failed
/// authentication, schema drift) is reported as "no session present" so the
/// caller re-authenticates instead of crashing.
pub struct EncryptedSessionStore {
    dir: PathBuf,
    path: PathBuf,
    key: Arc<Zeroizing<[u8; 32]>>,
}

impl EncryptedSessionStore {
    pub fn new(dir: &Path, key: Arc<Zeroizing<[u8; 32]>>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            path: dir.join(SESSION_FILE),
            key,
        }
    }

    pub fn save(&self, session: &SessionRecord) -> Result<(), TillError> {
        let plain = rmp_serde::to_vec(session).map_err(|e| TillError::Encode(e.to_string()))?;
        let saved_at = crate::now_micros();
        let nonce_bytes = derive_nonce(&session.account_id, saved_at);
        let key: &[u8; 32] = &self.key;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| TillError::Validation(format!("invalid session key: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain.as_slice())
            .map_err(|e| TillError::Validation(format!("session encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(SESSION_MAGIC.len() + nonce_bytes.len() + ciphertext.len());
        out.extend_from_slice(SESSION_MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&out)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| TillError::Io(e.error))?;
        Ok(())
    }

    /// Loads the cached session, or `None` when there is nothing usable on
    /// disk. Corruption is logged and swallowed.
    pub fn load(&self) -> Option<SessionRecord> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, "session blob unreadable; forcing re-login");
                return None;
            }
        };
        if bytes.len() < SESSION_MAGIC.len() + 12 || &bytes[..SESSION_MAGIC.len()] != SESSION_MAGIC
        {
            warn!("session blob malformed; forcing re-login");
            return None;
        }
        let nonce = Nonce::from_slice(&bytes[8..20]);
        let key: &[u8; 32] = &self.key;
        let cipher = match Aes256Gcm::new_from_slice(key) {
            Ok(cipher) => cipher,
            Err(err) => {
                warn!(error = %err, "invalid session key; forcing re-login");
                return None;
            }
        };
        let plain = match cipher.decrypt(nonce, &bytes[20..]) {
            Ok(plain) => plain,
            Err(_) => {
                warn!("session blob failed authentication; forcing re-login");
                return None;
            }
        };
        match rmp_serde::from_slice(&plain) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(error = %err, "session blob schema mismatch; forcing re-login");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<(), TillError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TillError::Io(err)),
        }
    }
}

/// 96-bit nonce: save timestamp (64-bit) + hash of account id and timestamp
/// (32-bit). Saves for one account never reuse a timestamp.
fn derive_nonce(account_id: &str, saved_at_micros: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&saved_at_micros.to_be_bytes());
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(saved_at_micros.to_be_bytes());
    let digest = hasher.finalize();
    nonce[8..].copy_from_slice(&digest[..4]);
    nonce
}
