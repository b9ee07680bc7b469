//! Day-scoped salted hashing of raw beacon addresses
//!
//! The salt is a pure function of the facility's local calendar day, so ids
//! are stable within a day and unlinkable across days without any stored
//! rotation state.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use sha2::{Digest, Sha256};

use crate::core::{DeviceId, DEVICE_ID_HEX_LEN};
use crate::utils::config::IdentityConfig;
use crate::validation::error::ConfigError;

const SALT_HEX_LEN: usize = 32;

/// Canonical form of a hardware address: trimmed and upper-cased
pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone)]
pub struct IdentityAnonymizer {
    secret: Option<String>,
    offset: FixedOffset,
}

impl IdentityAnonymizer {
    pub fn new(config: &IdentityConfig) -> Result<Self, ConfigError> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigError::invalid(
                "identity.utc_offset_minutes",
                config.utc_offset_minutes,
                "not a valid UTC offset",
            )
        })?;
        Ok(Self {
            secret: config.salt_secret.clone(),
            offset,
        })
    }

    /// Opaque id for `raw_address` on the calendar day containing `now`
    pub fn resolve(&self, raw_address: &str, now: DateTime<Utc>) -> DeviceId {
        let salt = self.salt_for_day(self.local_day(now));
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(normalize_address(raw_address).as_bytes());
        DeviceId::from_hex(truncated_hex(&hasher.finalize(), DEVICE_ID_HEX_LEN))
    }

    /// Salt for one calendar day
    pub fn salt_for_day(&self, day: NaiveDate) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("beacon-positioning-{}-salt", day.format("%Y-%m-%d")).as_bytes());
        if let Some(secret) = &self.secret {
            hasher.update(secret.as_bytes());
        }
        truncated_hex(&hasher.finalize(), SALT_HEX_LEN)
    }

    /// Facility-local calendar day of an instant
    pub fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }
}

impl Default for IdentityAnonymizer {
    fn default() -> Self {
        Self {
            secret: None,
            offset: Utc.fix(),
        }
    }
}

fn truncated_hex(digest: &[u8], len: usize) -> String {
    let mut out = hex::encode(digest);
    out.truncate(len);
    out
}
