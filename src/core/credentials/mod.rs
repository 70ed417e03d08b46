//! Durable per-(user, service) authorization records.
//!
//! Every credential is a pair: a row in the `credentials` table and an
//! owner-only JSON secret file that the worker subprocess reads at launch.
//! Mutations stage the file next to its final path, write the row inside a
//! transaction, and only commit once the file has been moved into place, so a
//! failure on either side leaves neither side updated.

mod cipher;
mod types;

pub use cipher::SecretCipher;
pub use types::{AuthPayload, Credential, CredentialSummary, PayloadUpdate};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::service::ServiceTag;
use crate::platform::{NativePlatform, Platform};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no active credentials for user '{user}' on service '{service}'")]
    NotFound { user: String, service: String },

    #[error("credential storage failed: {0}")]
    Storage(String),

    #[error("invalid credential key: {0}")]
    InvalidKey(String),

    #[error("invalid purge threshold: {0}")]
    InvalidThreshold(String),
}

impl From<rusqlite::Error> for CredentialError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(format!("database: {}", e))
    }
}

impl From<std::io::Error> for CredentialError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(format!("secret file: {}", e))
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("secret encoding: {}", e))
    }
}

const MAX_USER_ID_LEN: usize = 256;

struct CredentialRow {
    user_id: String,
    service: String,
    refresh_secret: String,
    access_token: Option<String>,
    token_expires_at: Option<String>,
    secret_path: String,
    active: bool,
    created_at: String,
    updated_at: String,
}

const ROW_COLUMNS: &str = "user_id, service, refresh_secret, access_token, token_expires_at, \
                           secret_path, active, created_at, updated_at";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRow> {
    Ok(CredentialRow {
        user_id: row.get(0)?,
        service: row.get(1)?,
        refresh_secret: row.get(2)?,
        access_token: row.get(3)?,
        token_expires_at: row.get(4)?,
        secret_path: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CredentialError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CredentialError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

fn validate_user(user_id: &str) -> Result<(), CredentialError> {
    if user_id.trim().is_empty()
        || user_id.len() > MAX_USER_ID_LEN
        || user_id.chars().any(char::is_control)
    {
        return Err(CredentialError::InvalidKey(format!(
            "user id '{}' is empty, too long or contains control characters",
            user_id.escape_default()
        )));
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

/// Write `contents` to a sibling temp file with owner-only permissions.
fn stage_secret_file(path: &Path, contents: &[u8]) -> Result<PathBuf, CredentialError> {
    let tmp = staging_path(path);
    let written = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        NativePlatform::restrict_file_permissions(&tmp);
        file.write_all(contents)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(tmp)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_if_present(path: &Path) -> Result<Option<Vec<u8>>, CredentialError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Put back what was at `path` before a rename whose row change did not commit.
fn restore_secret_file(path: &Path, prior: Option<&[u8]>) {
    let restored = match prior {
        Some(bytes) => stage_secret_file(path, bytes).and_then(|tmp| {
            std::fs::rename(&tmp, path).map_err(|e| {
                let _ = std::fs::remove_file(&tmp);
                CredentialError::from(e)
            })
        }),
        None => remove_if_present(path).map_err(CredentialError::from),
    };
    if let Err(e) = restored {
        warn!(path = %path.display(), "could not roll back secret file: {}", e);
    }
}

pub struct CredentialStore {
    db: Arc<Mutex<Connection>>,
    secrets_dir: PathBuf,
    cipher: SecretCipher,
}

impl CredentialStore {
    pub fn new(db: Arc<Mutex<Connection>>, secrets_dir: impl Into<PathBuf>, cipher: SecretCipher) -> Self {
        Self {
            db,
            secrets_dir: secrets_dir.into(),
            cipher,
        }
    }

    pub async fn initialize(&self) -> Result<(), CredentialError> {
        std::fs::create_dir_all(&self.secrets_dir)?;
        NativePlatform::restrict_dir_permissions(&self.secrets_dir);

        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                service TEXT NOT NULL,
                refresh_secret TEXT NOT NULL,
                access_token TEXT,
                token_expires_at TEXT,
                secret_path TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, service)
            )",
            [],
        )?;
        Ok(())
    }

    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    /// Deterministic secret-file location for (user, service).
    pub fn secret_path(&self, user_id: &str, service: &ServiceTag) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(user_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(service.as_str().as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.secrets_dir
            .join(format!("{}-{}.json", &digest[..24], service))
    }

    fn not_found(user_id: &str, service: &ServiceTag) -> CredentialError {
        CredentialError::NotFound {
            user: user_id.to_string(),
            service: service.to_string(),
        }
    }

    fn decode_row(&self, row: CredentialRow) -> Result<Credential, CredentialError> {
        let service = ServiceTag::new(row.service).map_err(|e| CredentialError::Storage(e.to_string()))?;
        let expires_at = row
            .token_expires_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        Ok(Credential {
            user_id: row.user_id,
            service,
            payload: AuthPayload {
                refresh_secret: self.cipher.open_column(&row.refresh_secret)?,
                access_token: row
                    .access_token
                    .as_deref()
                    .map(|t| self.cipher.open_column(t))
                    .transpose()?,
                expires_at,
            },
            secret_path: PathBuf::from(row.secret_path),
            active: row.active,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }

    fn seal_optional(&self, value: Option<&str>) -> Result<Option<String>, CredentialError> {
        value.map(|v| self.cipher.encrypt(v)).transpose()
    }

    /// Persist a freshly authorized credential, replacing any prior record.
    pub async fn create(
        &self,
        user_id: &str,
        service: &ServiceTag,
        payload: AuthPayload,
    ) -> Result<Credential, CredentialError> {
        validate_user(user_id)?;
        let path = self.secret_path(user_id, service);
        let contents = serde_json::to_vec_pretty(&payload)?;
        let sealed_secret = self.cipher.encrypt(&payload.refresh_secret)?;
        let sealed_token = self.seal_optional(payload.access_token.as_deref())?;
        let now = Utc::now();
        let now_str = timestamp(now);
        let path_str = path.to_string_lossy().to_string();

        let mut db = self.db.lock().await;
        let prior = read_if_present(&path)?;
        let tmp = stage_secret_file(&path, &contents)?;

        let tx = match db.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
        };
        let upsert = tx.execute(
            "INSERT INTO credentials
                (user_id, service, refresh_secret, access_token, token_expires_at,
                 secret_path, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
             ON CONFLICT(user_id, service) DO UPDATE SET
                refresh_secret = excluded.refresh_secret,
                access_token = excluded.access_token,
                token_expires_at = excluded.token_expires_at,
                secret_path = excluded.secret_path,
                active = 1,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            params![
                user_id,
                service.as_str(),
                sealed_secret,
                sealed_token,
                payload.expires_at.map(timestamp),
                path_str,
                now_str,
            ],
        );
        if let Err(e) = upsert {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = tx.commit() {
            restore_secret_file(&path, prior.as_deref());
            return Err(e.into());
        }

        info!(user = user_id, service = %service, "stored credentials");
        Ok(Credential {
            user_id: user_id.to_string(),
            service: service.clone(),
            payload,
            secret_path: path,
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Active credential for (user, service).
    ///
    /// A record whose secret file has vanished is deactivated on the spot and
    /// reported as not found.
    pub async fn get(&self, user_id: &str, service: &ServiceTag) -> Result<Credential, CredentialError> {
        let db = self.db.lock().await;
        let row = db
            .query_row(
                &format!(
                    "SELECT {} FROM credentials WHERE user_id = ?1 AND service = ?2",
                    ROW_COLUMNS
                ),
                params![user_id, service.as_str()],
                map_row,
            )
            .optional()?;

        let Some(row) = row.filter(|r| r.active) else {
            return Err(Self::not_found(user_id, service));
        };

        if !Path::new(&row.secret_path).exists() {
            warn!(
                user = user_id,
                service = %service,
                path = %row.secret_path,
                "secret file missing, deactivating credentials"
            );
            db.execute(
                "UPDATE credentials SET active = 0, updated_at = ?3
                 WHERE user_id = ?1 AND service = ?2 AND active = 1",
                params![user_id, service.as_str(), timestamp(Utc::now())],
            )?;
            return Err(Self::not_found(user_id, service));
        }

        self.decode_row(row)
    }

    /// Merge refreshed token material into the secret file and the record.
    pub async fn update(
        &self,
        user_id: &str,
        service: &ServiceTag,
        update: PayloadUpdate,
    ) -> Result<Credential, CredentialError> {
        let mut db = self.db.lock().await;
        let row = db
            .query_row(
                &format!(
                    "SELECT {} FROM credentials WHERE user_id = ?1 AND service = ?2 AND active = 1",
                    ROW_COLUMNS
                ),
                params![user_id, service.as_str()],
                map_row,
            )
            .optional()?
            .ok_or_else(|| Self::not_found(user_id, service))?;

        let mut credential = self.decode_row(row)?;
        let path = credential.secret_path.clone();

        // Unknown keys written by other tooling survive the merge.
        let prior = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(user = user_id, service = %service, "secret file missing on update, deactivating");
                db.execute(
                    "UPDATE credentials SET active = 0, updated_at = ?3
                     WHERE user_id = ?1 AND service = ?2",
                    params![user_id, service.as_str(), timestamp(Utc::now())],
                )?;
                return Err(Self::not_found(user_id, service));
            }
            Err(e) => return Err(e.into()),
        };
        let mut file_body = serde_json::from_slice::<serde_json::Value>(&prior)?;

        update.apply(&mut credential.payload);
        let merged = serde_json::to_value(&credential.payload)?;
        if let (Some(target), Some(source)) = (file_body.as_object_mut(), merged.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        } else {
            file_body = merged;
        }

        let now = Utc::now();
        let sealed_secret = self.cipher.encrypt(&credential.payload.refresh_secret)?;
        let sealed_token = self.seal_optional(credential.payload.access_token.as_deref())?;
        let tmp = stage_secret_file(&path, &serde_json::to_vec_pretty(&file_body)?)?;

        let tx = match db.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
        };
        let updated = tx.execute(
            "UPDATE credentials
             SET refresh_secret = ?3, access_token = ?4, token_expires_at = ?5, updated_at = ?6
             WHERE user_id = ?1 AND service = ?2",
            params![
                user_id,
                service.as_str(),
                sealed_secret,
                sealed_token,
                credential.payload.expires_at.map(timestamp),
                timestamp(now),
            ],
        );
        if let Err(e) = updated {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = tx.commit() {
            restore_secret_file(&path, Some(&prior));
            return Err(e.into());
        }

        debug!(user = user_id, service = %service, "refreshed credentials");
        credential.updated_at = now;
        Ok(credential)
    }

    /// Soft delete: the secret file stays so a reconnect can reuse it.
    /// Returns whether an active record was flipped.
    pub async fn deactivate(&self, user_id: &str, service: &ServiceTag) -> Result<bool, CredentialError> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE credentials SET active = 0, updated_at = ?3
             WHERE user_id = ?1 AND service = ?2 AND active = 1",
            params![user_id, service.as_str(), timestamp(Utc::now())],
        )?;
        if changed > 0 {
            info!(user = user_id, service = %service, "deactivated credentials");
        }
        Ok(changed > 0)
    }

    /// Remove the record and its secret file. Absent credentials are not an error.
    pub async fn delete(&self, user_id: &str, service: &ServiceTag) -> Result<(), CredentialError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let stored_path: Option<String> = tx
            .query_row(
                "SELECT secret_path FROM credentials WHERE user_id = ?1 AND service = ?2",
                params![user_id, service.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "DELETE FROM credentials WHERE user_id = ?1 AND service = ?2",
            params![user_id, service.as_str()],
        )?;

        let path = stored_path
            .map(PathBuf::from)
            .unwrap_or_else(|| self.secret_path(user_id, service));
        remove_if_present(&path)?;
        let _ = remove_if_present(&staging_path(&path));
        tx.commit()?;

        info!(user = user_id, service = %service, "deleted credentials");
        Ok(())
    }

    /// Hard-delete inactive records last touched before `now - older_than`.
    /// Returns how many records were removed.
    pub async fn purge_stale(&self, older_than: chrono::Duration) -> Result<usize, CredentialError> {
        if older_than < chrono::Duration::zero() {
            return Err(CredentialError::InvalidThreshold(format!(
                "purge age must not be negative, got {}",
                older_than
            )));
        }
        let Some(cutoff) = Utc::now().checked_sub_signed(older_than) else {
            debug!("purge age reaches before the earliest representable time, nothing to purge");
            return Ok(0);
        };
        let cutoff = timestamp(cutoff);
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let stale: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, secret_path FROM credentials WHERE active = 0 AND updated_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut purged = 0;
        for (id, path) in stale {
            if let Err(e) = remove_if_present(Path::new(&path)) {
                warn!(path = %path, error = %e, "could not remove stale secret file, keeping record");
                continue;
            }
            tx.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
            purged += 1;
        }
        tx.commit()?;

        if purged > 0 {
            info!(purged, "purged stale credentials");
        }
        Ok(purged)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<CredentialSummary>, CredentialError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT service, active, access_token IS NOT NULL, token_expires_at, updated_at
             FROM credentials WHERE user_id = ?1 ORDER BY service ASC",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (service, active, has_access_token, expires, updated) = row?;
            summaries.push(CredentialSummary {
                service,
                active,
                has_access_token,
                token_expires_at: expires.as_deref().map(parse_timestamp).transpose()?,
                updated_at: parse_timestamp(&updated)?,
            });
        }
        Ok(summaries)
    }
}
