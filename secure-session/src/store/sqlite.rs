//! SQLite-backed store
//!
//! Secret key material and session state are sealed with AES-256-GCM under a
//! pickle key before they reach the database. Public keys are stored in the
//! clear so pre-key listings never need the pickle key.

use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use zeroize::Zeroizing;

use super::{trust_decision, Direction, SessionStore, TrustedIdentity};
use crate::address::PeerAddress;
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKeyRecord};
use crate::crypto::ratchet::SessionState;
use crate::envelope::NONCE_LENGTH;
use crate::error::{SessionError, SessionResult};

/// Key that seals secrets at rest
pub type PickleKey = [u8; 32];

const NEXT_PRE_KEY_ID: &str = "next_pre_key_id";

/// Persistent store over a SQLite pool
pub struct SqliteStore {
    db: SqlitePool,
    pickle_key: Zeroizing<PickleKey>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and run migrations
    pub async fn open(path: &str, pickle_key: PickleKey) -> SessionResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let db = SqlitePoolOptions::new().connect_with(options).await?;

        let store = Self::with_pool(db, pickle_key).await?;
        tracing::info!(path, "Session store opened with WAL mode");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn open_in_memory(pickle_key: PickleKey) -> SessionResult<Self> {
        // One connection: every connection to :memory: is a separate database
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(db, pickle_key).await
    }

    /// Wrap an existing pool, running migrations on it
    pub async fn with_pool(db: SqlitePool, pickle_key: PickleKey) -> SessionResult<Self> {
        sqlx::migrate!("../migrations").run(&db).await?;
        Ok(Self {
            db,
            pickle_key: Zeroizing::new(pickle_key),
        })
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    fn seal(&self, plaintext: &[u8]) -> SessionResult<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.pickle_key.as_ref()));
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SessionError::Internal("failed to seal stored secret".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn unseal(&self, sealed: &str) -> SessionResult<Zeroizing<Vec<u8>>> {
        let raw = BASE64
            .decode(sealed)
            .map_err(|e| SessionError::Serialization(format!("sealed value is not base64: {}", e)))?;
        if raw.len() <= NONCE_LENGTH {
            return Err(SessionError::Serialization("sealed value too short".to_string()));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LENGTH);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.pickle_key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| SessionError::Internal("failed to unseal stored secret (wrong pickle key?)".to_string()))
    }

    fn seal_session(&self, state: &SessionState) -> SessionResult<String> {
        let json = Zeroizing::new(serde_json::to_vec(state)?);
        self.seal(&json)
    }

    fn unseal_session(&self, sealed: &str) -> SessionResult<SessionState> {
        let json = self.unseal(sealed)?;
        Ok(serde_json::from_slice(&json)?)
    }

    fn signed_pre_key_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> SessionResult<SignedPreKeyRecord> {
        let key_id: i64 = row.try_get("key_id")?;
        let secret: String = row.try_get("secret_key")?;
        let signature: Vec<u8> = row.try_get("signature")?;
        let created_at: i64 = row.try_get("created_at")?;

        Ok(SignedPreKeyRecord {
            key_id: to_u32(key_id)?,
            key_pair: Curve25519KeyPair::from_secret_bytes(&self.unseal(&secret)?)?,
            signature,
            created_at,
        })
    }
}

fn to_u32(value: i64) -> SessionResult<u32> {
    u32::try_from(value).map_err(|_| SessionError::Internal(format!("stored id {} out of range", value)))
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_identity(&self) -> SessionResult<IdentityKeyPair> {
        let row = sqlx::query("SELECT secret_key FROM local_identity WHERE id = 1")
            .fetch_optional(&self.db)
            .await?
            .ok_or(SessionError::NotProvisioned)?;

        let secret: String = row.try_get("secret_key")?;
        IdentityKeyPair::from_secret_bytes(&self.unseal(&secret)?)
    }

    async fn get_registration_id(&self) -> SessionResult<u32> {
        let row = sqlx::query("SELECT registration_id FROM local_identity WHERE id = 1")
            .fetch_optional(&self.db)
            .await?
            .ok_or(SessionError::NotProvisioned)?;

        to_u32(row.try_get("registration_id")?)
    }

    async fn save_local_identity(&self, identity: &IdentityKeyPair, registration_id: u32) -> SessionResult<()> {
        let sealed = self.seal(&identity.secret_key_bytes())?;

        // The primary key check makes a second insert fail instead of overwrite
        let result = sqlx::query(
            r#"
            INSERT INTO local_identity (id, identity_key, secret_key, registration_id)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(identity.public_key_bytes())
        .bind(sealed)
        .bind(i64::from(registration_id))
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::AlreadyProvisioned);
        }
        Ok(())
    }

    async fn save_pre_key(&self, key_id: u32, key_pair: &Curve25519KeyPair) -> SessionResult<()> {
        let sealed = self.seal(&key_pair.secret_key_bytes())?;
        let mut tx = self.db.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO pre_keys (key_id, public_key, secret_key)
            VALUES (?, ?, ?)
            ON CONFLICT(key_id) DO UPDATE SET
                public_key = excluded.public_key,
                secret_key = excluded.secret_key
            "#,
        )
        .bind(i64::from(key_id))
        .bind(key_pair.public_key_bytes())
        .bind(sealed)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO store_meta (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)
            "#,
        )
        .bind(NEXT_PRE_KEY_ID)
        .bind(i64::from(key_id) + 1)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_pre_key(&self, key_id: u32) -> SessionResult<Curve25519KeyPair> {
        let row = sqlx::query("SELECT secret_key FROM pre_keys WHERE key_id = ?")
            .bind(i64::from(key_id))
            .fetch_optional(&self.db)
            .await?
            .ok_or(SessionError::PreKeyNotFound(key_id))?;

        let secret: String = row.try_get("secret_key")?;
        Curve25519KeyPair::from_secret_bytes(&self.unseal(&secret)?)
    }

    async fn delete_pre_key(&self, key_id: u32) -> SessionResult<()> {
        sqlx::query("DELETE FROM pre_keys WHERE key_id = ?")
            .bind(i64::from(key_id))
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn take_pre_key(&self, key_id: u32) -> SessionResult<Curve25519KeyPair> {
        // A single DELETE ... RETURNING: two concurrent takers cannot both see the row
        let row = sqlx::query("DELETE FROM pre_keys WHERE key_id = ? RETURNING secret_key")
            .bind(i64::from(key_id))
            .fetch_optional(&self.db)
            .await?
            .ok_or(SessionError::PreKeyNotFound(key_id))?;

        let secret: String = row.try_get("secret_key")?;
        Curve25519KeyPair::from_secret_bytes(&self.unseal(&secret)?)
    }

    async fn one_time_pre_keys(&self) -> SessionResult<Vec<OneTimePreKey>> {
        let rows = sqlx::query("SELECT key_id, public_key FROM pre_keys ORDER BY key_id ASC")
            .fetch_all(&self.db)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(OneTimePreKey {
                    key_id: to_u32(row.try_get("key_id")?)?,
                    public_key: row.try_get("public_key")?,
                })
            })
            .collect()
    }

    async fn count_pre_keys(&self) -> SessionResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pre_keys")
            .fetch_one(&self.db)
            .await?;
        Ok(count as usize)
    }

    async fn next_pre_key_id(&self) -> SessionResult<u32> {
        let next: Option<i64> = sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
            .bind(NEXT_PRE_KEY_ID)
            .fetch_optional(&self.db)
            .await?;
        Ok(to_u32(next.unwrap_or(1))?.max(1))
    }

    async fn save_signed_pre_key(&self, record: &SignedPreKeyRecord) -> SessionResult<()> {
        let sealed = self.seal(&record.key_pair.secret_key_bytes())?;
        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE signed_pre_keys SET is_current = 0 WHERE is_current = 1")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO signed_pre_keys (key_id, public_key, secret_key, signature, created_at, is_current)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(key_id) DO UPDATE SET
                public_key = excluded.public_key,
                secret_key = excluded.secret_key,
                signature = excluded.signature,
                created_at = excluded.created_at,
                is_current = 1
            "#,
        )
        .bind(i64::from(record.key_id))
        .bind(record.key_pair.public_key_bytes())
        .bind(sealed)
        .bind(&record.signature)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> SessionResult<SignedPreKeyRecord> {
        let row = sqlx::query(
            "SELECT key_id, secret_key, signature, created_at FROM signed_pre_keys WHERE key_id = ?",
        )
        .bind(i64::from(key_id))
        .fetch_optional(&self.db)
        .await?
        .ok_or(SessionError::SignedPreKeyNotFound(key_id))?;

        self.signed_pre_key_from_row(&row)
    }

    async fn current_signed_pre_key(&self) -> SessionResult<Option<SignedPreKeyRecord>> {
        let row = sqlx::query(
            "SELECT key_id, secret_key, signature, created_at FROM signed_pre_keys WHERE is_current = 1",
        )
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| self.signed_pre_key_from_row(&row)).transpose()
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> SessionResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM signed_pre_keys WHERE key_id = ?")
            .bind(i64::from(key_id))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM accepted_base_keys WHERE signed_pre_key_id = ?")
            .bind(i64::from(key_id))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<bool> {
        let mut tx = self.db.begin().await?;

        let existing: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT identity_key FROM trusted_identities WHERE name = ? AND device_id = ?",
        )
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .fetch_optional(&mut *tx)
        .await?;

        let changed = match existing {
            Some(known) if known == identity_key => false,
            Some(_) => {
                sqlx::query(
                    r#"
                    UPDATE trusted_identities
                    SET identity_key = ?, verified = 0, updated_at = CURRENT_TIMESTAMP
                    WHERE name = ? AND device_id = ?
                    "#,
                )
                .bind(identity_key)
                .bind(&address.name)
                .bind(i64::from(address.device_id))
                .execute(&mut *tx)
                .await?;
                true
            }
            None => {
                sqlx::query(
                    "INSERT INTO trusted_identities (name, device_id, identity_key, verified) VALUES (?, ?, ?, 1)",
                )
                .bind(&address.name)
                .bind(i64::from(address.device_id))
                .bind(identity_key)
                .execute(&mut *tx)
                .await?;
                true
            }
        };

        tx.commit().await?;
        Ok(changed)
    }

    async fn is_trusted(&self, address: &PeerAddress, identity_key: &[u8], _direction: Direction) -> SessionResult<bool> {
        let existing = self.get_trusted_identity(address).await?;
        Ok(trust_decision(existing.as_ref(), identity_key))
    }

    async fn trust_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trusted_identities (name, device_id, identity_key, verified)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(name, device_id) DO UPDATE SET
                identity_key = excluded.identity_key,
                verified = 1,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .bind(identity_key)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_trusted_identity(&self, address: &PeerAddress) -> SessionResult<Option<TrustedIdentity>> {
        let row = sqlx::query(
            "SELECT identity_key, verified FROM trusted_identities WHERE name = ? AND device_id = ?",
        )
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(TrustedIdentity {
                address: address.clone(),
                identity_key: row.try_get("identity_key")?,
                verified: row.try_get("verified")?,
            })),
            None => Ok(None),
        }
    }

    async fn load_session(&self, address: &PeerAddress) -> SessionResult<Option<SessionState>> {
        let sealed: Option<String> = sqlx::query_scalar(
            "SELECT session_data FROM sessions WHERE name = ? AND device_id = ?",
        )
        .bind(&address.name)
        .bind(i64::from(address.device_id))
        .fetch_optional(&self.db)
        .await?;

        sealed.map(|s| self.unseal_session(&s)).transpose()
    }

    async fn save_session(&self, address: &PeerAddress, state: &SessionState) -> SessionResult<()> {
        let sealed = self.seal_session(state)?;
        upsert_session(&self.db, address, &sealed).await
    }

    async fn delete_session(&self, address: &PeerAddress) -> SessionResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE name = ? AND device_id = ?")
            .bind(&address.name)
            .bind(i64::from(address.device_id))
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_sessions(&self) -> SessionResult<Vec<PeerAddress>> {
        let rows = sqlx::query("SELECT name, device_id FROM sessions ORDER BY name, device_id")
            .fetch_all(&self.db)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PeerAddress::new(
                    row.try_get::<String, _>("name")?,
                    to_u32(row.try_get("device_id")?)?,
                ))
            })
            .collect()
    }

    async fn commit_first_message(
        &self,
        address: &PeerAddress,
        signed_pre_key_id: u32,
        one_time_pre_key_id: Option<u32>,
        state: &SessionState,
    ) -> SessionResult<()> {
        let sealed = self.seal_session(state)?;
        let mut tx = self.db.begin().await?;

        // Dropping the transaction on any early return rolls it back
        if let Some(key_id) = one_time_pre_key_id {
            let result = sqlx::query("DELETE FROM pre_keys WHERE key_id = ?")
                .bind(i64::from(key_id))
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() != 1 {
                return Err(SessionError::PreKeyNotFound(key_id));
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO accepted_base_keys (signed_pre_key_id, base_key)
            VALUES (?, ?)
            ON CONFLICT(signed_pre_key_id, base_key) DO NOTHING
            "#,
        )
        .bind(i64::from(signed_pre_key_id))
        .bind(state.base_key())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(SessionError::FirstMessageReplayed { signed_pre_key_id });
        }

        upsert_session(&mut *tx, address, &sealed).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_session<'e, E>(executor: E, address: &PeerAddress, sealed: &str) -> SessionResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO sessions (name, device_id, session_data, updated_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(name, device_id) DO UPDATE SET
            session_data = excluded.session_data,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&address.name)
    .bind(i64::from(address.device_id))
    .bind(sealed)
    .execute(executor)
    .await?;
    Ok(())
}

/// Derive a pickle key from a user password or device secret
pub fn derive_pickle_key(secret: &[u8], salt: &[u8]) -> SessionResult<PickleKey> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"SecureSession Pickle Key v1", &mut key)
        .map_err(|e| SessionError::Internal(format!("HKDF expansion failed: {}", e)))?;
    Ok(key)
}

/// Generate a random pickle key (for new installations)
pub fn generate_pickle_key() -> PickleKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
