//! # Node Key Repository
//!
//! Shared secrets that replicas present to the primary.
//!
//! ## Key Lifecycle
//! ```text
//! issue_key(node_id) ──► secret = hex(32 random bytes)   (shown once)
//!                        key_hash = argon2(secret)       (stored)
//!
//! request ──► X-Node-ID + X-Signature ──► verify(node_id, secret)
//!                                          ├─ inactive / unknown → false
//!                                          └─ argon2 match → true, last_used_at = now
//! ```

use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};

/// Length of a generated secret before hex encoding.
pub const SECRET_BYTES: usize = 32;

/// A registered replica credential. The secret itself is never stored.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct NodeKey {
    pub node_id: String,
    pub name: String,
    #[serde(skip)]
    pub key_hash: String,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Repository for replica credentials.
#[derive(Debug, Clone)]
pub struct NodeKeyRepository {
    pool: SqlitePool,
}

impl NodeKeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        NodeKeyRepository { pool }
    }

    /// Issues (or re-issues) a key for a node and returns the plaintext
    /// secret. Re-issuing replaces the old hash and reactivates the key.
    pub async fn issue_key(&self, node_id: &str, name: &str, now: DateTime<Utc>) -> DbResult<String> {
        let secret = generate_secret();
        let key_hash = hash_secret(&secret)?;

        sqlx::query(
            r#"
            INSERT INTO sync_node_keys (node_id, name, key_hash, is_active, created_at)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT(node_id) DO UPDATE SET
                name = excluded.name,
                key_hash = excluded.key_hash,
                is_active = 1
            "#,
        )
        .bind(node_id)
        .bind(name)
        .bind(&key_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(node_id = %node_id, "Issued node key");
        Ok(secret)
    }

    /// Checks a presented secret against the node's active key and records
    /// its use.
    pub async fn verify(&self, node_id: &str, secret: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let Some(key) = self.get(node_id).await? else {
            debug!(node_id = %node_id, "Unknown node");
            return Ok(false);
        };

        if !key.is_active {
            debug!(node_id = %node_id, "Node key is deactivated");
            return Ok(false);
        }

        if !verify_secret(secret, &key.key_hash) {
            return Ok(false);
        }

        sqlx::query("UPDATE sync_node_keys SET last_used_at = ?2 WHERE node_id = ?1")
            .bind(node_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(true)
    }

    pub async fn get(&self, node_id: &str) -> DbResult<Option<NodeKey>> {
        let key = sqlx::query_as::<_, NodeKey>(
            r#"
            SELECT node_id, name, key_hash, is_active, last_used_at, created_at
            FROM sync_node_keys
            WHERE node_id = ?1
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key)
    }

    pub async fn list(&self) -> DbResult<Vec<NodeKey>> {
        let keys = sqlx::query_as::<_, NodeKey>(
            r#"
            SELECT node_id, name, key_hash, is_active, last_used_at, created_at
            FROM sync_node_keys
            ORDER BY node_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    /// Revokes a node's access without forgetting it.
    pub async fn deactivate(&self, node_id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE sync_node_keys SET is_active = 0 WHERE node_id = ?1")
            .bind(node_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("NodeKey", node_id));
        }

        info!(node_id = %node_id, "Deactivated node key");
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn hash_secret(secret: &str) -> DbResult<String> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| DbError::Internal(format!("Failed to hash node key: {}", e)))?;

    Ok(hash.to_string())
}

fn verify_secret(secret: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed_hash)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_issue_and_verify() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let keys = db.node_keys();
        let now = Utc::now();

        let secret = keys.issue_key("replica-a", "Basement jukebox", now).await.unwrap();
        assert_eq!(secret.len(), SECRET_BYTES * 2);

        assert!(keys.verify("replica-a", &secret, now).await.unwrap());
        assert!(!keys.verify("replica-a", "wrong", now).await.unwrap());
        assert!(!keys.verify("replica-b", &secret, now).await.unwrap());

        let stored = keys.get("replica-a").await.unwrap().unwrap();
        assert_eq!(stored.last_used_at, Some(now));
        assert_ne!(stored.key_hash, secret);
    }

    #[tokio::test]
    async fn test_deactivated_key_is_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let keys = db.node_keys();
        let now = Utc::now();

        let secret = keys.issue_key("replica-a", "A", now).await.unwrap();
        keys.deactivate("replica-a").await.unwrap();

        assert!(!keys.verify("replica-a", &secret, now).await.unwrap());
        assert!(keys.deactivate("nobody").await.is_err());

        // Re-issuing reactivates with a fresh secret.
        let fresh = keys.issue_key("replica-a", "A", now).await.unwrap();
        assert!(keys.verify("replica-a", &fresh, now).await.unwrap());
        assert!(!keys.verify("replica-a", &secret, now).await.unwrap());
    }
}
