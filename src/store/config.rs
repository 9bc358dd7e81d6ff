// =============================================================================
// Store: configuration — exchanges, credentials, risk limits, blacklist
// =============================================================================
//
// Credentials rest encrypted with an HMAC-SHA256 keystream keyed from
// ENCRYPTION_KEY and a random per-value nonce; they are decrypted on demand
// and never logged.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rusqlite::params;
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::exchanges::venues::VENUES;
use crate::exchanges::Credentials;
use crate::risk::RiskLimits;
use crate::runtime_config::RuntimeConfig;

use super::{sql_to_ts, ts_to_sql, Store};

type HmacSha256 = Hmac<Sha256>;

// -----------------------------------------------------------------------------
// Symmetric keystream cipher
// -----------------------------------------------------------------------------

const NONCE_LEN: usize = 16;

fn keystream_block(key: &str, nonce: &[u8], counter: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(nonce);
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let mut block = [0u8; 32];
    block.copy_from_slice(&digest);
    block
}

pub(crate) fn encrypt_secret(key: &str, plaintext: &str) -> String {
    let nonce = *Uuid::new_v4().as_bytes();
    let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
    out.extend_from_slice(&nonce);

    for (i, chunk) in plaintext.as_bytes().chunks(32).enumerate() {
        let block = keystream_block(key, &nonce, i as u32);
        for (b, k) in chunk.iter().zip(block.iter()) {
            out.push(b ^ k);
        }
    }
    hex::encode(out)
}

pub(crate) fn decrypt_secret(key: &str, encoded: &str) -> Result<String> {
    let raw = hex::decode(encoded).context("decode credential hex")?;
    if raw.len() < NONCE_LEN {
        bail!("credential ciphertext too short");
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

    let mut plain = Vec::with_capacity(ciphertext.len());
    for (i, chunk) in ciphertext.chunks(32).enumerate() {
        let block = keystream_block(key, nonce, i as u32);
        for (b, k) in chunk.iter().zip(block.iter()) {
            plain.push(b ^ k);
        }
    }
    String::from_utf8(plain).context("credential plaintext is not UTF-8")
}

// -----------------------------------------------------------------------------
// Exchange configuration
// -----------------------------------------------------------------------------

/// Exchange config row as the API sees it; secrets reduced to presence flags.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeConfigRow {
    pub slug: String,
    pub display_name: String,
    pub api_type: String,
    pub tier: u8,
    pub enabled: bool,
    pub has_credentials: bool,
    pub updated_at: DateTime<Utc>,
}

/// Blacklist entry.
#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntry {
    pub symbol: String,
    pub reason: Option<String>,
    pub blacklisted_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Seed config_exchanges with the venue table; existing rows are kept.
    pub async fn seed_exchanges(&self) -> Result<()> {
        let conn = self.lock().await;
        for venue in VENUES {
            conn.execute(
                "INSERT OR IGNORE INTO config_exchanges
                    (slug, display_name, api_type, tier, enabled, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    venue.slug,
                    venue.display_name,
                    match venue.api_type {
                        crate::exchanges::venues::ApiType::Generic => "generic",
                        crate::exchanges::venues::ApiType::Native => "native",
                    },
                    venue.tier as i64,
                    ts_to_sql(Utc::now()),
                ],
            )
            .context("seed exchange row")?;
        }
        Ok(())
    }

    pub async fn list_exchanges(&self) -> Result<Vec<ExchangeConfigRow>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT slug, display_name, api_type, tier, enabled,
                        (api_key_enc IS NOT NULL OR wallet_address_enc IS NOT NULL),
                        updated_at
                 FROM config_exchanges ORDER BY tier, slug",
            )
            .context("prepare exchanges query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ExchangeConfigRow {
                    slug: row.get(0)?,
                    display_name: row.get(1)?,
                    api_type: row.get(2)?,
                    tier: row.get::<_, i64>(3)? as u8,
                    enabled: row.get::<_, i64>(4)? != 0,
                    has_credentials: row.get::<_, i64>(5)? != 0,
                    updated_at: sql_to_ts(&row.get::<_, String>(6)?),
                })
            })
            .context("query exchanges")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map exchange row")?);
        }
        Ok(out)
    }

    /// Slugs of enabled exchanges that hold at least one credential.
    pub async fn list_credentialed_exchanges(&self) -> Result<Vec<String>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT slug FROM config_exchanges
                 WHERE enabled = 1
                   AND (api_key_enc IS NOT NULL OR wallet_address_enc IS NOT NULL)",
            )
            .context("prepare credentialed exchanges query")?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("query credentialed exchanges")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map slug")?);
        }
        Ok(out)
    }

    pub async fn set_exchange_enabled(&self, slug: &str, enabled: bool) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE config_exchanges SET enabled = ?2, updated_at = ?3 WHERE slug = ?1",
            params![slug, enabled as i64, ts_to_sql(Utc::now())],
        )
        .context("set exchange enabled")?;
        Ok(())
    }

    pub async fn set_credentials(
        &self,
        slug: &str,
        credentials: &Credentials,
        encryption_key: &str,
    ) -> Result<()> {
        let enc = |value: &str| -> Option<String> {
            if value.is_empty() {
                None
            } else {
                Some(encrypt_secret(encryption_key, value))
            }
        };

        let conn = self.lock().await;
        conn.execute(
            "UPDATE config_exchanges SET
                api_key_enc = ?2, api_secret_enc = ?3,
                passphrase_enc = ?4, wallet_address_enc = ?5,
                updated_at = ?6
             WHERE slug = ?1",
            params![
                slug,
                enc(&credentials.api_key),
                enc(&credentials.api_secret),
                enc(&credentials.passphrase),
                enc(&credentials.wallet_address),
                ts_to_sql(Utc::now()),
            ],
        )
        .context("store credentials")?;
        Ok(())
    }

    /// Decrypt credentials for one venue; None when nothing is configured.
    pub async fn get_credentials(
        &self,
        slug: &str,
        encryption_key: &str,
    ) -> Result<Option<Credentials>> {
        let conn = self.lock().await;
        let row: Option<(Option<String>, Option<String>, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT api_key_enc, api_secret_enc, passphrase_enc, wallet_address_enc
                 FROM config_exchanges WHERE slug = ?1 AND enabled = 1",
                params![slug],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query credentials")?;

        let Some((key_enc, secret_enc, pass_enc, wallet_enc)) = row else {
            return Ok(None);
        };

        let dec = |value: Option<String>| -> Result<String> {
            match value {
                Some(v) => decrypt_secret(encryption_key, &v),
                None => Ok(String::new()),
            }
        };

        let credentials = Credentials {
            api_key: dec(key_enc)?,
            api_secret: dec(secret_enc)?,
            passphrase: dec(pass_enc)?,
            wallet_address: dec(wallet_enc)?,
        };

        if credentials.is_empty() {
            Ok(None)
        } else {
            Ok(Some(credentials))
        }
    }

    // -------------------------------------------------------------------------
    // Risk limits (singleton active row)
    // -------------------------------------------------------------------------

    pub async fn load_risk_limits(&self) -> Result<RiskLimits> {
        let conn = self.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM config_risk_limits WHERE id = 1 AND is_active = 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query risk limits")?;

        match body {
            Some(json) => serde_json::from_str(&json).context("parse risk limits"),
            None => Ok(RiskLimits::default()),
        }
    }

    pub async fn save_risk_limits(&self, limits: &RiskLimits) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO config_risk_limits (id, is_active, body, updated_at)
             VALUES (1, 1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET
                body = excluded.body, updated_at = excluded.updated_at",
            params![serde_json::to_string(limits)?, ts_to_sql(Utc::now())],
        )
        .context("save risk limits")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Strategy parameters (runtime config overrides)
    // -------------------------------------------------------------------------

    pub async fn load_strategy_config(&self) -> Result<Option<RuntimeConfig>> {
        let conn = self.lock().await;
        let body: Option<String> = conn
            .query_row("SELECT body FROM config_strategy WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query strategy config")?;

        match body {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("parse strategy config")?,
            )),
            None => Ok(None),
        }
    }

    pub async fn save_strategy_config(&self, config: &RuntimeConfig) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO config_strategy (id, body, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET
                body = excluded.body, updated_at = excluded.updated_at",
            params![serde_json::to_string(config)?, ts_to_sql(Utc::now())],
        )
        .context("save strategy config")?;
        Ok(())
    }

    pub async fn factory_reset_settings(&self) -> Result<()> {
        let conn = self.lock().await;
        conn.execute("DELETE FROM config_strategy", [])
            .context("reset strategy config")?;
        conn.execute("DELETE FROM config_risk_limits", [])
            .context("reset risk limits")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Blacklist (unique by symbol)
    // -------------------------------------------------------------------------

    pub async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, reason, blacklisted_by, created_at
                 FROM symbol_blacklist ORDER BY symbol",
            )
            .context("prepare blacklist query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(BlacklistEntry {
                    symbol: row.get(0)?,
                    reason: row.get(1)?,
                    blacklisted_by: row.get(2)?,
                    created_at: sql_to_ts(&row.get::<_, String>(3)?),
                })
            })
            .context("query blacklist")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map blacklist row")?);
        }
        Ok(out)
    }

    pub async fn add_blacklist(
        &self,
        symbol: &str,
        reason: Option<&str>,
        blacklisted_by: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO symbol_blacklist (symbol, reason, blacklisted_by, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (symbol) DO UPDATE SET
                reason = excluded.reason, blacklisted_by = excluded.blacklisted_by",
            params![
                symbol.to_uppercase(),
                reason,
                blacklisted_by,
                ts_to_sql(Utc::now()),
            ],
        )
        .context("add blacklist entry")?;
        Ok(())
    }

    pub async fn remove_blacklist(&self, symbol: &str) -> Result<bool> {
        let conn = self.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM symbol_blacklist WHERE symbol = ?1",
                params![symbol.to_uppercase()],
            )
            .context("remove blacklist entry")?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn secret_roundtrip() {
        let key = "test-encryption-key";
        let secret = "sk-live-abcdef0123456789-longer-than-one-block-for-sure";
        let encrypted = encrypt_secret(key, secret);
        assert_ne!(encrypted, secret);
        assert_eq!(decrypt_secret(key, &encrypted).unwrap(), secret);

        // Wrong key yields garbage or an error, never the plaintext.
        match decrypt_secret("wrong-key", &encrypted) {
            Ok(plain) => assert_ne!(plain, secret),
            Err(_) => {}
        }
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let key = "k";
        let a = encrypt_secret(key, "same-secret");
        let b = encrypt_secret(key, "same-secret");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn credentials_roundtrip_through_store() {
        let store = Store::open_in_memory().unwrap();
        store.seed_exchanges().await.unwrap();

        assert!(store
            .get_credentials("binance_futures", "key")
            .await
            .unwrap()
            .is_none());

        let creds = Credentials {
            api_key: "api-key".into(),
            api_secret: "api-secret".into(),
            passphrase: String::new(),
            wallet_address: String::new(),
        };
        store
            .set_credentials("binance_futures", &creds, "key")
            .await
            .unwrap();

        let loaded = store
            .get_credentials("binance_futures", "key")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.api_key, "api-key");
        assert_eq!(loaded.api_secret, "api-secret");

        let slugs = store.list_credentialed_exchanges().await.unwrap();
        assert_eq!(slugs, vec!["binance_futures".to_string()]);
    }

    #[tokio::test]
    async fn risk_limits_default_then_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let defaults = store.load_risk_limits().await.unwrap();
        assert_eq!(defaults.max_position_size_usd, dec!(5000));

        let mut limits = defaults.clone();
        limits.max_position_size_usd = dec!(10000);
        store.save_risk_limits(&limits).await.unwrap();

        let loaded = store.load_risk_limits().await.unwrap();
        assert_eq!(loaded.max_position_size_usd, dec!(10000));
    }

    #[tokio::test]
    async fn blacklist_unique_by_symbol() {
        let store = Store::open_in_memory().unwrap();
        store.add_blacklist("doge", Some("meme"), Some("operator")).await.unwrap();
        store.add_blacklist("DOGE", Some("still a meme"), None).await.unwrap();

        let entries = store.list_blacklist().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].symbol, "DOGE");
        assert_eq!(entries[0].reason.as_deref(), Some("still a meme"));

        assert!(store.remove_blacklist("doge").await.unwrap());
        assert!(!store.remove_blacklist("doge").await.unwrap());
    }
}
