use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes128Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Error};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::CredentialRow;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Md5,
    Sha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivProtocol {
    Des,
    Aes,
}

/// Decrypted credential material; lives in memory only, never logged.
#[derive(Clone)]
pub enum SnmpCredential {
    V2c {
        community: String,
    },
    V3 {
        security_name: String,
        auth_protocol: Option<AuthProtocol>,
        auth_key: Option<String>,
        priv_protocol: Option<PrivProtocol>,
        priv_key: Option<String>,
    },
}

impl std::fmt::Debug for SnmpCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnmpCredential::V2c { .. } => f.write_str("SnmpCredential::V2c{..}"),
            SnmpCredential::V3 { security_name, .. } => {
                write!(f, "SnmpCredential::V3{{security_name={}, ..}}", security_name)
            }
        }
    }
}

/// Resolves device identities to decrypted SNMP credentials. Read-only over
/// the relational store; the key never leaves the process.
pub struct Vault {
    cipher: Aes128Gcm,
}

impl Vault {
    /// `key_hex` is the 128-bit vault key as 32 hex characters.
    pub fn new(key_hex: &str) -> Result<Self, Error> {
        let key_bytes = hex::decode(key_hex).context("VAULT_KEY is not valid hex")?;
        if key_bytes.len() != 16 {
            bail!("VAULT_KEY must be 16 bytes (32 hex characters)");
        }
        let key = Key::<Aes128Gcm>::from_slice(&key_bytes);
        Ok(Vault {
            cipher: Aes128Gcm::new(key),
        })
    }

    /// Seals a secret as base64(nonce || ciphertext). Used by fixtures and
    /// by the provisioning path outside the core.
    pub fn seal(&self, plaintext: &str) -> Result<String, Error> {
        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;
        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn open(&self, sealed: &str) -> Result<String, Error> {
        let combined = BASE64.decode(sealed).context("ciphertext is not base64")?;
        if combined.len() <= NONCE_LEN {
            bail!("ciphertext too short");
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed (wrong key or tampered data)"))?;
        String::from_utf8(plaintext).context("decrypted secret is not utf-8")
    }

    /// `decrypt(device_id)` per the vault contract: `None` when the device
    /// has no credential row.
    pub async fn credential_for(
        &self,
        pool: &PgPool,
        device_id: Uuid,
    ) -> Result<Option<SnmpCredential>, Error> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT device_id, version, community_ciphertext, security_name,
                    auth_protocol, auth_key_ciphertext, priv_protocol, priv_key_ciphertext
             FROM snmp_credentials WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => self.decrypt_row(&row).map(Some),
        }
    }

    pub fn decrypt_row(&self, row: &CredentialRow) -> Result<SnmpCredential, Error> {
        match row.version {
            2 => {
                let sealed = row
                    .community_ciphertext
                    .as_ref()
                    .ok_or_else(|| anyhow!("v2c credential without community"))?;
                Ok(SnmpCredential::V2c {
                    community: self.open(sealed)?,
                })
            }
            3 => {
                let security_name = row
                    .security_name
                    .clone()
                    .ok_or_else(|| anyhow!("v3 credential without security name"))?;
                debug!("vault({}): decrypting v3 credential", row.device_id);
                let auth_protocol = match row.auth_protocol.as_deref() {
                    None => None,
                    Some("MD5") => Some(AuthProtocol::Md5),
                    Some("SHA") => Some(AuthProtocol::Sha),
                    Some(other) => bail!("unknown auth protocol {:?}", other),
                };
                let priv_protocol = match row.priv_protocol.as_deref() {
                    None => None,
                    Some("DES") => Some(PrivProtocol::Des),
                    Some("AES") => Some(PrivProtocol::Aes),
                    Some(other) => bail!("unknown priv protocol {:?}", other),
                };
                let auth_key = row
                    .auth_key_ciphertext
                    .as_ref()
                    .map(|sealed| self.open(sealed))
                    .transpose()?;
                let priv_key = row
                    .priv_key_ciphertext
                    .as_ref()
                    .map(|sealed| self.open(sealed))
                    .transpose()?;
                Ok(SnmpCredential::V3 {
                    security_name,
                    auth_protocol,
                    auth_key,
                    priv_protocol,
                    priv_key,
                })
            }
            other => bail!("unsupported credential version {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn rejects_malformed_keys() {
        assert!(Vault::new("too-short").is_err());
        assert!(Vault::new("0011").is_err());
        assert!(Vault::new(KEY).is_ok());
    }

    #[test]
    fn seal_then_open_recovers_secret() {
        let vault = Vault::new(KEY).unwrap();
        let sealed = vault.seal("s3cr3t-community").unwrap();
        assert_ne!(sealed, "s3cr3t-community");
        assert_eq!(vault.open(&sealed).unwrap(), "s3cr3t-community");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let vault = Vault::new(KEY).unwrap();
        let sealed = vault.seal("secret").unwrap();
        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = BASE64.encode(bytes);
        assert!(vault.open(&tampered).is_err());
    }

    #[test]
    fn wrong_key_cannot_open() {
        let vault = Vault::new(KEY).unwrap();
        let other = Vault::new("ffeeddccbbaa99887766554433221100").unwrap();
        let sealed = vault.seal("secret").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn decrypts_v2c_row() {
        let vault = Vault::new(KEY).unwrap();
        let row = CredentialRow {
            device_id: Uuid::new_v4(),
            version: 2,
            community_ciphertext: Some(vault.seal("public").unwrap()),
            security_name: None,
            auth_protocol: None,
            auth_key_ciphertext: None,
            priv_protocol: None,
            priv_key_ciphertext: None,
        };
        match vault.decrypt_row(&row).unwrap() {
            SnmpCredential::V2c { community } => assert_eq!(community, "public"),
            other => panic!("unexpected credential {:?}", other),
        }
    }

    #[test]
    fn decrypts_v3_row_with_protocols() {
        let vault = Vault::new(KEY).unwrap();
        let row = CredentialRow {
            device_id: Uuid::new_v4(),
            version: 3,
            community_ciphertext: None,
            security_name: Some("monitor".into()),
            auth_protocol: Some("SHA".into()),
            auth_key_ciphertext: Some(vault.seal("authpass").unwrap()),
            priv_protocol: Some("AES".into()),
            priv_key_ciphertext: Some(vault.seal("privpass").unwrap()),
        };
        match vault.decrypt_row(&row).unwrap() {
            SnmpCredential::V3 {
                security_name,
                auth_protocol,
                auth_key,
                priv_protocol,
                priv_key,
            } => {
                assert_eq!(security_name, "monitor");
                assert_eq!(auth_protocol, Some(AuthProtocol::Sha));
                assert_eq!(auth_key.as_deref(), Some("authpass"));
                assert_eq!(priv_protocol, Some(PrivProtocol::Aes));
                assert_eq!(priv_key.as_deref(), Some("privpass"));
            }
            other => panic!("unexpected credential {:?}", other),
        }
    }
}
