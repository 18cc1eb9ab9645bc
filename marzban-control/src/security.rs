use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, error, info};

use crate::error::{ControlError, Result};

/// Marker prefix for encrypted configuration values
pub const ENCRYPTED_PREFIX: &str = "encrypted:";

/// PBKDF2-HMAC-SHA256 iteration count for key derivation
const KDF_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 16;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Dotted paths whose values are encrypted at rest
pub const SENSITIVE_FIELDS: [&str; 4] = [
    "marzban.password",
    "telegram.bot_token",
    "telegram.chat_id",
    "api.secret_key",
];

/// Local symmetric vault for configuration secrets.
///
/// Key material lives in the vault directory: a random salt (`.salt`), a
/// generated master secret (`.master`) and the derived AES-128 key
/// (`.security_key`), each mode 0600 under a 0700 directory.
pub struct SecretsVault {
    dir: PathBuf,
    cipher: Aes128Gcm,
}

impl SecretsVault {
    /// Default vault directory: `~/.marzban_manager`
    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home).join(".marzban_manager")
    }

    /// Open the vault, generating key material on first run
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        set_mode(&dir, 0o700)?;

        let salt = load_or_create(&dir.join(".salt"), || {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            salt.to_vec()
        })?;

        let master = load_or_create(&dir.join(".master"), || {
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            URL_SAFE_NO_PAD.encode(secret).into_bytes()
        })?;

        let key_path = dir.join(".security_key");
        let key = if key_path.exists() {
            std::fs::read(&key_path)?
        } else {
            let mut derived = [0u8; KEY_LEN];
            pbkdf2_hmac::<Sha256>(&master, &salt, KDF_ITERATIONS, &mut derived);
            std::fs::write(&key_path, derived)?;
            set_mode(&key_path, 0o600)?;
            info!(dir = %dir.display(), "New encryption key generated");
            derived.to_vec()
        };

        if key.len() != KEY_LEN {
            return Err(ControlError::Crypto(format!(
                "invalid key length {} in {}",
                key.len(),
                key_path.display()
            )));
        }

        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&key));
        debug!(dir = %dir.display(), "Secrets vault initialized");

        Ok(Self { dir, cipher })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Encrypt a value; output is base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| ControlError::Crypto("encryption failed".to_string()))?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(envelope))
    }

    /// Decrypt a base64(nonce || ciphertext) envelope
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let envelope = STANDARD
            .decode(encoded)
            .map_err(|e| ControlError::Crypto(format!("invalid envelope encoding: {}", e)))?;

        if envelope.len() <= NONCE_LEN {
            return Err(ControlError::Crypto("envelope too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ControlError::Crypto("decryption failed or data tampered".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| ControlError::Crypto("decrypted data is not UTF-8".to_string()))
    }

    /// Encrypt every sensitive dotted path in a config document
    pub fn seal_document(&self, doc: &serde_json::Value) -> Result<serde_json::Value> {
        let mut sealed = doc.clone();

        for path in SENSITIVE_FIELDS {
            if let Some(value) = get_nested(&sealed, path) {
                let raw = match value.as_str() {
                    Some(s) if !s.is_empty() && !s.starts_with(ENCRYPTED_PREFIX) => s.to_string(),
                    _ => continue,
                };
                let encrypted = self.encrypt(&raw)?;
                set_nested(
                    &mut sealed,
                    path,
                    serde_json::Value::String(format!("{}{}", ENCRYPTED_PREFIX, encrypted)),
                );
            }
        }

        Ok(sealed)
    }

    /// Decrypt every sealed sensitive field in a config document
    pub fn unseal_document(&self, doc: &serde_json::Value) -> serde_json::Value {
        let mut unsealed = doc.clone();

        for path in SENSITIVE_FIELDS {
            let encrypted = match get_nested(&unsealed, path).and_then(|v| v.as_str()) {
                Some(s) if s.starts_with(ENCRYPTED_PREFIX) => {
                    s[ENCRYPTED_PREFIX.len()..].to_string()
                }
                _ => continue,
            };

            match self.decrypt(&encrypted) {
                Ok(plain) => {
                    set_nested(&mut unsealed, path, serde_json::Value::String(plain));
                }
                Err(e) => {
                    error!(field = path, error = %e, "Failed to decrypt config field");
                }
            }
        }

        unsealed
    }
}

/// Mask a secret for logging, keeping `visible` chars on each end
pub fn mask_secret(data: &str, visible: usize) -> String {
    let len = data.chars().count();
    if len == 0 {
        return String::new();
    }
    if len <= visible * 2 {
        return "*".repeat(len);
    }

    let start: String = data.chars().take(visible).collect();
    let end: String = data.chars().skip(len - visible).collect();
    format!("{}{}{}", start, "*".repeat(len - visible * 2), end)
}

/// Read a value at a dotted path in a JSON document
pub fn get_nested<'a>(doc: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = doc;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// Set a value at a dotted path, creating intermediate objects
pub fn set_nested(doc: &mut serde_json::Value, path: &str, value: serde_json::Value) {
    let keys: Vec<&str> = path.split('.').collect();
    let mut current = doc;

    for key in &keys[..keys.len() - 1] {
        if !current.get(*key).map(|v| v.is_object()).unwrap_or(false) {
            if let Some(obj) = current.as_object_mut() {
                obj.insert((*key).to_string(), serde_json::json!({}));
            } else {
                return;
            }
        }
        current = current
            .get_mut(*key)
            .expect("intermediate object just inserted");
    }

    if let Some(obj) = current.as_object_mut() {
        obj.insert(keys[keys.len() - 1].to_string(), value);
    }
}

fn load_or_create(path: &Path, generate: impl FnOnce() -> Vec<u8>) -> Result<Vec<u8>> {
    if path.exists() {
        Ok(std::fs::read(path)?)
    } else {
        let data = generate();
        std::fs::write(path, &data)?;
        set_mode(path, 0o600)?;
        Ok(data)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
