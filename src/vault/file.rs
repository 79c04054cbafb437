//! File-backed encrypted vault.
//!
//! One JSON file per `(service, key)` record under the vault directory.
//! Filenames are derived from a hash of the pair so arbitrary names never
//! reach the filesystem; the human-readable names live inside the record.
//! Files are written with owner-only permissions.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::TokenVault;
use crate::Result;
use crate::auth::audit::{self, AuditEvent};
use crate::crypto::{self, DerivedKey, SecretBox};

/// On-disk record: encrypted secret plus enough metadata to enumerate and
/// rotate without decrypting.
#[derive(Debug, Serialize, Deserialize)]
struct VaultRecord {
    service: String,
    key: String,
    secret: SecretBox,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// Encrypted file-per-record vault.
pub struct FileVault {
    base_dir: PathBuf,
    // RwLock so rotation can swap the key while reads are in flight.
    key: RwLock<DerivedKey>,
}

impl FileVault {
    /// Open (or create) a vault at `base_dir` with the given passphrase.
    ///
    /// # Errors
    ///
    /// Fails when the passphrase is too weak or the directory cannot be
    /// created.
    pub fn open(base_dir: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        crypto::validate_key(passphrase)?;

        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)?;
            restrict_permissions(&base_dir, 0o700);
        }

        Ok(Self {
            base_dir,
            key: RwLock::new(DerivedKey::from_passphrase(passphrase)),
        })
    }

    fn record_path(&self, service: &str, key: &str) -> PathBuf {
        // NUL-separated so ("ab","c") and ("a","bc") never collide
        let mut hasher = Sha256::new();
        hasher.update(service.as_bytes());
        hasher.update([0]);
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let name = format!("{hash:x}")[..16].to_string();
        self.base_dir.join(format!("{name}.json"))
    }

    fn read_record(path: &Path) -> Result<VaultRecord> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_record(&self, record: &VaultRecord) -> Result<()> {
        let path = self.record_path(&record.service, &record.key);
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&path, content)?;
        restrict_permissions(&path, 0o600);
        Ok(())
    }

    /// Paths of every record file currently in the vault directory.
    fn record_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl TokenVault for FileVault {
    async fn get_token(&self, service: &str, key: &str) -> Result<Option<String>> {
        let path = self.record_path(service, key);
        if !path.exists() {
            debug!(service = %service, key = %key, "No stored credential");
            return Ok(None);
        }

        let record = Self::read_record(&path)?;
        let derived = self.key.read().await;
        let plaintext = crypto::decrypt(&record.secret, &derived)?;

        audit::emit(AuditEvent::vault("vault.read", service, None));
        Ok(Some(plaintext))
    }

    async fn set_token(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let derived = self.key.read().await;
        let secret = crypto::encrypt(value, &derived)?;
        drop(derived);

        self.write_record(&VaultRecord {
            service: service.to_string(),
            key: key.to_string(),
            secret,
            updated_at: chrono::Utc::now(),
        })?;

        audit::emit(AuditEvent::vault("vault.write", service, None));
        info!(service = %service, key = %key, "Stored encrypted credential");
        Ok(())
    }

    async fn delete_token(&self, service: &str, key: &str) -> Result<()> {
        let path = self.record_path(service, key);
        if path.exists() {
            fs::remove_file(&path)?;
            audit::emit(AuditEvent::vault("vault.delete", service, None));
            info!(service = %service, key = %key, "Deleted stored credential");
        }
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let mut services = Vec::new();
        for path in self.record_paths()? {
            match Self::read_record(&path) {
                Ok(record) => services.push(record.service),
                Err(e) => warn!(path = %path.display(), error = %e, "Unreadable vault record"),
            }
        }
        services.sort();
        services.dedup();
        Ok(services)
    }

    async fn rotate_key(&self, old_passphrase: &str, new_passphrase: &str) -> Result<usize> {
        crypto::validate_key(new_passphrase)?;
        let old_key = DerivedKey::from_passphrase(old_passphrase);
        let new_key = DerivedKey::from_passphrase(new_passphrase);

        let mut rotated = 0usize;
        let mut skipped = 0usize;

        for path in self.record_paths()? {
            let record = match Self::read_record(&path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable record during rotation");
                    skipped += 1;
                    continue;
                }
            };

            // A record that does not decrypt under the old key is left
            // as-is; rotation must not destroy what it cannot convert.
            let plaintext = match crypto::decrypt(&record.secret, &old_key) {
                Ok(p) => p,
                Err(e) => {
                    warn!(service = %record.service, key = %record.key, error = %e, "Skipping record that fails to decrypt under the old key");
                    skipped += 1;
                    continue;
                }
            };

            let secret = crypto::encrypt(&plaintext, &new_key)?;
            self.write_record(&VaultRecord {
                service: record.service,
                key: record.key,
                secret,
                updated_at: chrono::Utc::now(),
            })?;
            rotated += 1;
        }

        *self.key.write().await = new_key;

        let mut details = serde_json::Map::new();
        details.insert("rotated".to_string(), serde_json::Value::from(rotated));
        details.insert("skipped".to_string(), serde_json::Value::from(skipped));
        audit::emit(AuditEvent::vault("vault.rotate", "*", Some(details)));
        info!(rotated, skipped, "Key rotation pass complete");

        Ok(rotated)
    }
}

/// Best-effort permission tightening; a failure is not worth aborting over
/// on filesystems that do not support Unix modes.
fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PASSPHRASE: &str = "a perfectly serviceable passphrase!!";

    fn open_vault(dir: &TempDir) -> FileVault {
        FileVault::open(dir.path(), PASSPHRASE).unwrap()
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);

        vault
            .set_token("coda", "api_token", "coda-secret-token")
            .await
            .unwrap();
        assert_eq!(
            vault.get_token("coda", "api_token").await.unwrap().as_deref(),
            Some("coda-secret-token")
        );
    }

    #[tokio::test]
    async fn missing_record_is_none_not_error() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);

        assert_eq!(vault.get_token("nothing", "api_token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_within_a_service_are_independent() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);

        vault
            .set_token("coda", "api_token", "the-api-token")
            .await
            .unwrap();
        vault
            .set_token("coda", "webhook_secret", "the-webhook-secret")
            .await
            .unwrap();

        assert_eq!(
            vault.get_token("coda", "api_token").await.unwrap().as_deref(),
            Some("the-api-token")
        );
        assert_eq!(
            vault
                .get_token("coda", "webhook_secret")
                .await
                .unwrap()
                .as_deref(),
            Some("the-webhook-secret")
        );

        // Deleting one key leaves the sibling intact
        vault.delete_token("coda", "api_token").await.unwrap();
        assert_eq!(vault.get_token("coda", "api_token").await.unwrap(), None);
        assert_eq!(
            vault
                .get_token("coda", "webhook_secret")
                .await
                .unwrap()
                .as_deref(),
            Some("the-webhook-secret")
        );
    }

    #[tokio::test]
    async fn plaintext_never_touches_disk() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);
        vault
            .set_token("coda", "api_token", "super-secret-value")
            .await
            .unwrap();

        for entry in fs::read_dir(dir.path()).unwrap() {
            let content = fs::read_to_string(entry.unwrap().path()).unwrap();
            assert!(!content.contains("super-secret-value"));
        }
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);

        vault.set_token("coda", "api_token", "old").await.unwrap();
        vault.set_token("coda", "api_token", "new").await.unwrap();
        assert_eq!(
            vault.get_token("coda", "api_token").await.unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);

        vault.set_token("coda", "api_token", "tok").await.unwrap();
        vault.delete_token("coda", "api_token").await.unwrap();
        assert_eq!(vault.get_token("coda", "api_token").await.unwrap(), None);

        // Deleting again is a no-op
        vault.delete_token("coda", "api_token").await.unwrap();
    }

    #[tokio::test]
    async fn list_services_is_sorted_and_deduplicated() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);

        vault.set_token("github", "api_token", "a").await.unwrap();
        vault.set_token("coda", "api_token", "b").await.unwrap();
        vault
            .set_token("coda", "webhook_secret", "c")
            .await
            .unwrap();

        // Two coda records, one listed service
        assert_eq!(vault.list_services().await.unwrap(), vec!["coda", "github"]);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let vault = open_vault(&dir);
            vault
                .set_token("coda", "api_token", "persistent")
                .await
                .unwrap();
        }

        let reopened = open_vault(&dir);
        assert_eq!(
            reopened
                .get_token("coda", "api_token")
                .await
                .unwrap()
                .as_deref(),
            Some("persistent")
        );
    }

    #[tokio::test]
    async fn weak_passphrase_is_rejected_at_open() {
        let dir = TempDir::new().unwrap();
        assert!(FileVault::open(dir.path(), "weak").is_err());
    }

    #[tokio::test]
    async fn rotation_reencrypts_and_old_key_stops_working() {
        let new_passphrase = "a completely different passphrase!!!";
        let dir = TempDir::new().unwrap();

        let vault = open_vault(&dir);
        vault
            .set_token("coda", "api_token", "rotate-me")
            .await
            .unwrap();
        vault
            .set_token("github", "api_token", "me-too")
            .await
            .unwrap();

        let rotated = vault.rotate_key(PASSPHRASE, new_passphrase).await.unwrap();
        assert_eq!(rotated, 2);

        // The live vault swapped to the new key
        assert_eq!(
            vault.get_token("coda", "api_token").await.unwrap().as_deref(),
            Some("rotate-me")
        );

        // A vault opened with the old passphrase can no longer decrypt
        let stale = open_vault(&dir);
        assert!(stale.get_token("coda", "api_token").await.is_err());

        // One opened with the new passphrase can
        let fresh = FileVault::open(dir.path(), new_passphrase).unwrap();
        assert_eq!(
            fresh
                .get_token("github", "api_token")
                .await
                .unwrap()
                .as_deref(),
            Some("me-too")
        );
    }

    #[tokio::test]
    async fn rotation_skips_undecryptable_records() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);
        vault.set_token("good", "api_token", "value").await.unwrap();

        // A record encrypted under some unrelated key
        let foreign_key = DerivedKey::from_passphrase("some unrelated vault passphrase!!");
        let secret = crypto::encrypt("orphan", &foreign_key).unwrap();
        vault
            .write_record(&VaultRecord {
                service: "orphan".to_string(),
                key: "api_token".to_string(),
                secret,
                updated_at: chrono::Utc::now(),
            })
            .unwrap();

        let rotated = vault
            .rotate_key(PASSPHRASE, "yet another strong passphrase here!!")
            .await
            .unwrap();

        // The good record rotated; the foreign one was skipped, not destroyed
        assert_eq!(rotated, 1);
        assert_eq!(
            vault.get_token("good", "api_token").await.unwrap().as_deref(),
            Some("value")
        );
    }

    #[tokio::test]
    async fn rotation_rejects_weak_new_passphrase() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);
        assert!(vault.rotate_key(PASSPHRASE, "short").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn record_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir);
        vault.set_token("coda", "api_token", "tok").await.unwrap();

        let path = vault.record_path("coda", "api_token");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
