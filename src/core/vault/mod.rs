use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::Mac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use tracing::{info, warn};

use crate::core::provider::{ProviderError, WorkflowProvider};

type HmacSha256 = hmac::Hmac<Sha256>;

/// Fixed salt mixed into the key derivation; bumping it invalidates every stored token.
const KEY_SALT: &[u8] = b"vmkeeper-vault-v1";

/// Environment variable holding the process-wide vault secret.
pub const SECRET_ENV: &str = "VMKEEPER_SECRET";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("token was rejected by the provider: {0}")]
    InvalidToken(String),

    #[error("provider unreachable while validating token: {0}")]
    ProviderUnreachable(String),

    #[error("account '{0}' not found")]
    NotFound(String),

    #[error("no active account")]
    NoActiveAccount,

    #[error("vault crypto failure: {0}")]
    Crypto(String),
}

/// Decrypted provider token. Never printed, never serialized.
pub struct AccessToken(String);

impl AccessToken {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Provider login; unique within the book.
    pub id: String,
    /// base64(nonce || ciphertext); plaintext never lands on disk.
    pub encrypted_token: String,
    pub label: String,
    pub is_owner: bool,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

/// Stored accounts plus the pointer to the active one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBook {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub active: Option<String>,
}

/// Operator-facing view of an account; carries no token material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub label: String,
    pub is_owner: bool,
    pub is_active: bool,
}

impl AccountBook {
    pub fn get(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn active_account(&self) -> Option<&Account> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    pub fn summaries(&self) -> Vec<AccountSummary> {
        self.accounts
            .iter()
            .map(|a| AccountSummary {
                id: a.id.clone(),
                label: a.label.clone(),
                is_owner: a.is_owner,
                is_active: self.active.as_deref() == Some(a.id.as_str()),
            })
            .collect()
    }

    pub fn set_active(&mut self, id: &str) -> Result<(), VaultError> {
        if self.get(id).is_none() {
            return Err(VaultError::NotFound(id.to_string()));
        }
        self.active = Some(id.to_string());
        Ok(())
    }

    /// Remove an account; if it was active, the first remaining account takes over.
    pub fn remove(&mut self, id: &str) -> Result<Account, VaultError> {
        let pos = self
            .accounts
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| VaultError::NotFound(id.to_string()))?;
        let removed = self.accounts.remove(pos);
        if self.active.as_deref() == Some(id) {
            self.active = self.accounts.first().map(|a| a.id.clone());
        }
        Ok(removed)
    }
}

/// Resolve the process-wide secret: `$VMKEEPER_SECRET`, else a machine identity
/// (hostname + user) so the key is stable across restarts on the same host.
pub fn process_secret() -> String {
    if let Ok(secret) = std::env::var(SECRET_ENV)
        && !secret.is_empty()
    {
        return secret;
    }
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}{}", hostname, whoami::username())
}

/// Derive a 256-bit key as HMAC-SHA256(salt, secret).
fn derive_key(secret: &str) -> Result<[u8; 32], VaultError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(KEY_SALT)
        .map_err(|e| VaultError::Crypto(e.to_string()))?;
    mac.update(secret.as_bytes());
    let bytes = mac.finalize().into_bytes();

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Encrypts provider tokens at rest and manages the account book.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(secret: &str) -> Result<Self, VaultError> {
        let key = derive_key(secret)?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::Crypto(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext value. Returns base64(nonce || ciphertext).
    fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    /// Decrypt a base64(nonce || ciphertext) value. Returns plaintext.
    fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VaultError::Crypto(format!("base64 decode failed: {}", e)))?;

        if combined.len() < 13 {
            return Err(VaultError::Crypto("encrypted value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VaultError::Crypto(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| VaultError::Crypto(format!("UTF-8 decode failed: {}", e)))
    }

    /// Validate `raw_token` against the provider and store it encrypted.
    /// Re-adding a known login replaces its token. The book is untouched on failure.
    pub async fn add_account(
        &self,
        book: &mut AccountBook,
        provider: &dyn WorkflowProvider,
        raw_token: &str,
    ) -> Result<AccountSummary, VaultError> {
        let token = raw_token.trim();
        if token.is_empty() {
            return Err(VaultError::InvalidToken("empty token".into()));
        }

        let identity = provider.validate_token(token).await.map_err(|e| match e {
            ProviderError::Auth(msg) | ProviderError::NotFound(msg) => {
                VaultError::InvalidToken(msg)
            }
            other => VaultError::ProviderUnreachable(other.to_string()),
        })?;

        let encrypted_token = self.encrypt(token)?;
        let is_owner = book.accounts.is_empty();
        match book.accounts.iter_mut().find(|a| a.id == identity.login) {
            Some(existing) => {
                info!("Updated token for account {}", identity.login);
                existing.encrypted_token = encrypted_token;
            }
            None => {
                info!("Added account {}", identity.login);
                book.accounts.push(Account {
                    id: identity.login.clone(),
                    encrypted_token,
                    label: identity.login.clone(),
                    is_owner,
                    added_at: Some(Utc::now()),
                });
            }
        }
        if book.active.is_none() {
            book.active = Some(identity.login.clone());
        }

        book.summaries()
            .into_iter()
            .find(|s| s.id == identity.login)
            .ok_or(VaultError::NotFound(identity.login))
    }

    /// Decrypt the active account's token for an outgoing provider call.
    pub fn active_token(&self, book: &AccountBook) -> Result<AccessToken, VaultError> {
        let account = book.active_account().ok_or(VaultError::NoActiveAccount)?;
        self.token_for(account)
    }

    pub fn token_for(&self, account: &Account) -> Result<AccessToken, VaultError> {
        self.decrypt(&account.encrypted_token)
            .map(AccessToken)
            .inspect_err(|e| warn!("Stored token for {} is unusable: {}", account.id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::mock::{MockProvider, Op};

    fn vault() -> CredentialVault {
        CredentialVault::new("test-secret").unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let vault = vault();
        let encrypted = vault.encrypt("ghp_super_secret").unwrap();
        assert_ne!(encrypted, "ghp_super_secret");
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "ghp_super_secret");
    }

    #[test]
    fn encrypt_produces_different_ciphertext_each_time() {
        let vault = vault();
        let a = vault.encrypt("same-input").unwrap();
        let b = vault.encrypt("same-input").unwrap();
        assert_ne!(a, b, "random nonce should produce different ciphertext");
    }

    #[test]
    fn different_secret_cannot_decrypt() {
        let encrypted = vault().encrypt("token").unwrap();
        let other = CredentialVault::new("other-secret").unwrap();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(VaultError::Crypto(_))
        ));
    }

    #[test]
    fn decrypt_rejects_short_and_invalid_input() {
        let vault = vault();
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(vault.decrypt(&short).is_err());
        assert!(vault.decrypt("not-valid-base64!!!").is_err());
    }

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken("ghp_visible".into());
        assert!(!format!("{:?}", token).contains("ghp_visible"));
    }

    #[tokio::test]
    async fn add_account_validates_and_encrypts() {
        let vault = vault();
        let provider = MockProvider::new();
        provider.accept_token("ghp_good", "octocat");
        let mut book = AccountBook::default();

        let summary = vault
            .add_account(&mut book, &provider, "  ghp_good \n")
            .await
            .unwrap();
        assert_eq!(summary.id, "octocat");
        assert!(summary.is_owner);
        assert!(summary.is_active);
        assert_ne!(book.accounts[0].encrypted_token, "ghp_good");
        assert_eq!(vault.active_token(&book).unwrap().expose(), "ghp_good");
    }

    #[tokio::test]
    async fn invalid_token_leaves_book_unchanged() {
        let vault = vault();
        let provider = MockProvider::new();
        provider.accept_token("ghp_good", "octocat");
        let mut book = AccountBook::default();
        vault
            .add_account(&mut book, &provider, "ghp_good")
            .await
            .unwrap();
        let before = book.clone();

        let err = vault
            .add_account(&mut book, &provider, "ghp_revoked")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidToken(_)));
        assert_eq!(book, before);
        assert_eq!(book.summaries().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_provider_is_reported_separately() {
        let vault = vault();
        let provider = MockProvider::new();
        provider.fail_next(
            Op::ValidateToken,
            ProviderError::Network("connection refused".into()),
        );
        let mut book = AccountBook::default();

        let err = vault
            .add_account(&mut book, &provider, "ghp_any")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ProviderUnreachable(_)));
        assert!(book.accounts.is_empty());
    }

    #[tokio::test]
    async fn second_account_is_not_owner_and_not_active() {
        let vault = vault();
        let provider = MockProvider::new();
        provider.accept_token("t1", "alice");
        provider.accept_token("t2", "bob");
        let mut book = AccountBook::default();
        vault.add_account(&mut book, &provider, "t1").await.unwrap();
        let bob = vault.add_account(&mut book, &provider, "t2").await.unwrap();

        assert!(!bob.is_owner);
        assert!(!bob.is_active);
        book.set_active("bob").unwrap();
        assert_eq!(vault.active_token(&book).unwrap().expose(), "t2");
    }

    #[test]
    fn set_active_unknown_account_fails() {
        let mut book = AccountBook::default();
        assert!(matches!(
            book.set_active("ghost"),
            Err(VaultError::NotFound(_))
        ));
    }

    #[test]
    fn active_token_without_account_fails() {
        let book = AccountBook::default();
        assert!(matches!(
            vault().active_token(&book),
            Err(VaultError::NoActiveAccount)
        ));
    }

    #[tokio::test]
    async fn removing_active_account_promotes_next() {
        let vault = vault();
        let provider = MockProvider::new();
        provider.accept_token("t1", "alice");
        provider.accept_token("t2", "bob");
        let mut book = AccountBook::default();
        vault.add_account(&mut book, &provider, "t1").await.unwrap();
        vault.add_account(&mut book, &provider, "t2").await.unwrap();

        book.remove("alice").unwrap();
        assert_eq!(book.active.as_deref(), Some("bob"));
        book.remove("bob").unwrap();
        assert_eq!(book.active, None);
        assert!(book.remove("bob").is_err());
    }
}
