/*
 *
 *  *
 *  *      Copyright (c) 2018-2025, SnackCloud All rights reserved.
 *  *
 *  *   Redistribution and use in source and binary forms, with or without
 *  *   modification, are permitted provided that the following conditions are met:
 *  *
 *  *   Redistributions of source code must retain the above copyright notice,
 *  *   this list of conditions and the following disclaimer.
 *  *   Redistributions in binary form must reproduce the above copyright
 *  *   notice, this list of conditions and the following disclaimer in the
 *  *   documentation and/or other materials provided with the distribution.
 *  *   Neither the name of the www.snackcloud.cn developer nor the names of its
 *  *   contributors may be used to endorse or promote products derived from
 *  *   this software without specific prior written permission.
 *  *   Author: SnackCloud
 *  *
 *
 */
use redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{LockerError, LockerResult};

/// Separator used inside slot keys; the key prefix must not contain it.
pub const KEY_SEPARATOR: char = ':';

/// Factory producing the underlying Redis client from the assembled
/// connection info, for tests and custom TLS setups.
pub type ClientBuilder = Arc<dyn Fn(ConnectionInfo) -> RedisResult<Client> + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
pub struct LockerConfig {
    /// Redis endpoints. The first endpoint is used; routing across several
    /// belongs to the client layer (see `client_builder`).
    pub init_address: Vec<String>,
    /// Prefix of every slot key.
    pub key_prefix: String,
    /// Lease validity window of each slot key.
    pub key_validity: Duration,
    /// Renewal period of the extension loop; `None` means `key_validity / 2`.
    pub extend_interval: Option<Duration>,
    /// Per-slot command timeout.
    pub try_next_after: Duration,
    /// Slot majority required for a valid acquisition; total slots are
    /// `2 * key_majority - 1`.
    pub key_majority: u32,
    /// Ask the server not to echo invalidations for this client's own
    /// writes (`CLIENT TRACKING ... NOLOOP`, requires server support).
    pub no_loop_tracking: bool,
    /// Disable client-side tracking and fall back to plain `SET NX PX`
    /// slot writes; waiters poll instead of being woken by invalidations.
    pub fallback_setpx: bool,
    /// Clock drift compensation subtracted from the validity window.
    pub drift_factor: f64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<i64>,
    #[serde(skip)]
    pub client_builder: Option<ClientBuilder>,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            init_address: Vec::new(),
            key_prefix: "quorumlock".to_string(),
            key_validity: Duration::from_secs(5),
            extend_interval: None,
            try_next_after: Duration::from_millis(20),
            key_majority: 2,
            no_loop_tracking: false,
            fallback_setpx: false,
            drift_factor: 0.01,
            username: None,
            password: None,
            database: None,
            client_builder: None,
        }
    }
}

impl std::fmt::Debug for LockerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockerConfig")
            .field("init_address", &self.init_address)
            .field("key_prefix", &self.key_prefix)
            .field("key_validity", &self.key_validity)
            .field("extend_interval", &self.extend_interval)
            .field("try_next_after", &self.try_next_after)
            .field("key_majority", &self.key_majority)
            .field("no_loop_tracking", &self.no_loop_tracking)
            .field("fallback_setpx", &self.fallback_setpx)
            .field("drift_factor", &self.drift_factor)
            .field("database", &self.database)
            .field("client_builder", &self.client_builder.is_some())
            .finish()
    }
}

impl LockerConfig {
    pub fn new<I, S>(init_address: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            init_address: init_address.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_key_validity(mut self, validity: Duration) -> Self {
        self.key_validity = validity;
        self
    }

    pub fn with_extend_interval(mut self, interval: Duration) -> Self {
        self.extend_interval = Some(interval);
        self
    }

    pub fn with_try_next_after(mut self, timeout: Duration) -> Self {
        self.try_next_after = timeout;
        self
    }

    pub fn with_key_majority(mut self, majority: u32) -> Self {
        self.key_majority = majority;
        self
    }

    pub fn with_no_loop_tracking(mut self, no_loop: bool) -> Self {
        self.no_loop_tracking = no_loop;
        self
    }

    pub fn with_fallback_setpx(mut self, fallback: bool) -> Self {
        self.fallback_setpx = fallback;
        self
    }

    pub fn with_drift_factor(mut self, factor: f64) -> Self {
        self.drift_factor = factor;
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_database(mut self, db: i64) -> Self {
        self.database = Some(db);
        self
    }

    pub fn with_client_builder(mut self, builder: ClientBuilder) -> Self {
        self.client_builder = Some(builder);
        self
    }

    /// Total slot count derived from the majority.
    pub fn total_slots(&self) -> u32 {
        self.key_majority * 2 - 1
    }

    /// Effective renewal period of the extension loop.
    pub fn interval(&self) -> Duration {
        self.extend_interval.unwrap_or(self.key_validity / 2)
    }

    pub fn validate(&self) -> LockerResult<()> {
        if self.init_address.is_empty() {
            return Err(LockerError::NoServer);
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains(KEY_SEPARATOR) {
            return Err(LockerError::Config(format!(
                "key prefix must be non-empty and must not contain '{KEY_SEPARATOR}'"
            )));
        }
        if self.key_majority == 0 {
            return Err(LockerError::Config("key majority must be at least 1".to_string()));
        }
        if self.key_validity.is_zero() {
            return Err(LockerError::Config("key validity must be non-zero".to_string()));
        }
        if self.interval() >= self.key_validity {
            return Err(LockerError::Config(
                "extend interval must be shorter than key validity".to_string(),
            ));
        }
        if self.try_next_after.is_zero() {
            return Err(LockerError::Config("slot command timeout must be non-zero".to_string()));
        }
        if !(0.0..1.0).contains(&self.drift_factor) {
            return Err(LockerError::Config("drift factor must be within [0, 1)".to_string()));
        }
        Ok(())
    }

    /// Assemble the connection info of the first endpoint. RESP3 is
    /// required for server-assisted invalidation pushes, so the protocol
    /// is forced whenever tracking is in use.
    pub fn connection_info(&self, resp3: bool) -> LockerResult<ConnectionInfo> {
        let address = self.init_address.first().ok_or(LockerError::NoServer)?;
        let mut url = if address.contains("://") {
            address.clone()
        } else {
            format!("redis://{address}")
        };
        if resp3 && !url.contains("protocol=") {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("protocol=resp3");
        }

        let mut conn_info: ConnectionInfo = url
            .as_str()
            .into_connection_info()
            .map_err(|e| LockerError::Config(e.to_string()))?;

        if let Some(username) = &self.username {
            conn_info.redis.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            conn_info.redis.password = Some(password.clone());
        }
        if let Some(db) = self.database {
            conn_info.redis.db = db;
        }
        Ok(conn_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_parameters() {
        let config = LockerConfig::new(["redis://127.0.0.1:6379"]);
        assert_eq!(config.key_validity, Duration::from_secs(5));
        assert_eq!(config.key_majority, 2);
        assert_eq!(config.total_slots(), 3);
        assert_eq!(config.interval(), Duration::from_millis(2500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_address_list() {
        let config = LockerConfig::default();
        assert!(matches!(config.validate(), Err(LockerError::NoServer)));
    }

    #[test]
    fn rejects_prefix_with_separator() {
        let config = LockerConfig::new(["127.0.0.1:6379"]).with_key_prefix("a:b");
        assert!(matches!(config.validate(), Err(LockerError::Config(_))));
    }

    #[test]
    fn rejects_interval_not_below_validity() {
        let config = LockerConfig::new(["127.0.0.1:6379"])
            .with_key_validity(Duration::from_secs(1))
            .with_extend_interval(Duration::from_secs(1));
        assert!(matches!(config.validate(), Err(LockerError::Config(_))));
    }

    #[test]
    fn builders_override_defaults() {
        let config = LockerConfig::new(["127.0.0.1:6379"])
            .with_key_prefix("jobs")
            .with_key_majority(3)
            .with_fallback_setpx(true)
            .with_key_validity(Duration::from_secs(10));
        assert_eq!(config.key_prefix, "jobs");
        assert_eq!(config.total_slots(), 5);
        assert!(config.fallback_setpx);
        assert_eq!(config.interval(), Duration::from_secs(5));
    }

    #[test]
    fn bare_address_gains_scheme_and_protocol() {
        let config = LockerConfig::new(["127.0.0.1:6379"]);
        let info = config.connection_info(true).unwrap();
        assert_eq!(info.redis.protocol, redis::ProtocolVersion::RESP3);
    }
}
