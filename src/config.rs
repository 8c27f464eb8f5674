// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// TOML configuration for the three deployable pieces: meta service,
// local service, client. Every struct deserializes with defaults so a
// minimal file stays minimal; validation runs as a separate pass and
// reports every mistake, not just the first.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{MmcError, Result};
use crate::types::RPC_TIMEOUT_SECS;

/// DRAM contributions must land on the huge-page boundary. 2 MiB.
pub const DRAM_SIZE_ALIGNMENT: u64 = 2 * 1024 * 1024;

// ---------------------------------------------------------------------------
// TLS block (shared)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enable: bool,
    pub ca: String,
    pub crl: String,
    pub cert: String,
    pub key: String,
    pub keypass: String,
    pub package: String,
    pub decrypter_lib: String,
}

impl TlsConfig {
    fn validate(&self, errors: &mut Vec<String>) {
        if !self.enable {
            return;
        }
        for (name, path) in [("tls.ca", &self.ca), ("tls.cert", &self.cert), ("tls.key", &self.key)] {
            if path.is_empty() {
                errors.push(format!("<{name}> must be set when tls.enable is true"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Meta service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetaServiceConfig {
    /// Listen URL, `tcp://ip:port`.
    pub meta_service_url: String,
    /// One of debug, info, warn, error.
    pub log_level: String,
    pub log_rotation_file_size: u64,
    pub log_rotation_file_count: u32,
    /// Evict once global usage reaches this percentage.
    pub evict_threshold_high: u16,
    /// Stop evicting once usage falls to this percentage.
    pub evict_threshold_low: u16,
    pub ha_enable: bool,
    pub meta_rebuild_enable: bool,
    /// Worker threads serving control RPCs.
    pub worker_threads: u16,
    pub default_ttl_ms: u64,
    pub tls: TlsConfig,
}

impl Default for MetaServiceConfig {
    fn default() -> Self {
        MetaServiceConfig {
            meta_service_url: "tcp://127.0.0.1:5000".into(),
            log_level: "info".into(),
            log_rotation_file_size: 64 * 1024 * 1024,
            log_rotation_file_count: 8,
            evict_threshold_high: 70,
            evict_threshold_low: 60,
            ha_enable: false,
            meta_rebuild_enable: false,
            worker_threads: 2,
            default_ttl_ms: crate::types::DEFAULT_TTL_MS,
            tls: TlsConfig::default(),
        }
    }
}

impl MetaServiceConfig {
    pub fn load_from_file(path: &Path) -> Result<MetaServiceConfig> {
        load(path)
    }

    /// Collect every configuration mistake. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if parse_tcp_url(&self.meta_service_url).is_none() {
            errors.push(format!(
                "<meta_service_url> `{}` is not a tcp://ip:port url",
                self.meta_service_url
            ));
        }
        if log_level_of(&self.log_level).is_none() {
            errors.push(format!("<log_level> `{}` is not one of debug/info/warn/error", self.log_level));
        }
        if self.evict_threshold_high <= self.evict_threshold_low {
            errors.push(format!(
                "<evict_threshold_high> {} must be greater than <evict_threshold_low> {}",
                self.evict_threshold_high, self.evict_threshold_low
            ));
        }
        if self.evict_threshold_high > 100 {
            errors.push("<evict_threshold_high> must be a percentage".into());
        }
        if self.worker_threads == 0 {
            errors.push("<worker_threads> must be positive".into());
        }
        self.tls.validate(&mut errors);
        errors
    }
}

// ---------------------------------------------------------------------------
// Local service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalServiceConfig {
    pub meta_service_url: String,
    pub world_size: u32,
    pub device_id: u32,
    pub rank_id: u32,
    /// 1 = take the rank id from the fabric instead of `rank_id`.
    pub auto_ranking: u8,
    pub config_store_url: String,
    pub hcom_url: String,
    /// Data-plane transport: sdma, roce or tcp.
    pub protocol: String,
    /// Exactly one of the two sizes may be positive.
    pub dram_size: u64,
    pub hbm_size: u64,
    pub tls: TlsConfig,
}

impl Default for LocalServiceConfig {
    fn default() -> Self {
        LocalServiceConfig {
            meta_service_url: "tcp://127.0.0.1:5000".into(),
            world_size: 1,
            device_id: 0,
            rank_id: 0,
            auto_ranking: 0,
            config_store_url: "tcp://127.0.0.1:6000".into(),
            hcom_url: "tcp://127.0.0.1:7000".into(),
            protocol: "sdma".into(),
            dram_size: DRAM_SIZE_ALIGNMENT,
            hbm_size: 0,
            tls: TlsConfig::default(),
        }
    }
}

impl LocalServiceConfig {
    pub fn load_from_file(path: &Path) -> Result<LocalServiceConfig> {
        load(path)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if parse_tcp_url(&self.meta_service_url).is_none() {
            errors.push(format!(
                "<meta_service_url> `{}` is not a tcp://ip:port url",
                self.meta_service_url
            ));
        }
        if self.world_size == 0 {
            errors.push("<world_size> must be positive".into());
        }
        if self.rank_id >= self.world_size && self.auto_ranking == 0 {
            errors.push(format!(
                "<rank_id> {} outside world of size {}",
                self.rank_id, self.world_size
            ));
        }
        if !matches!(self.protocol.as_str(), "sdma" | "roce" | "tcp") {
            errors.push(format!("<protocol> `{}` is not one of sdma/roce/tcp", self.protocol));
        }
        match (self.dram_size, self.hbm_size) {
            (0, 0) => errors.push("one of <dram.size>/<hbm.size> must be positive".into()),
            (d, h) if d > 0 && h > 0 => {
                errors.push(format!("<dram.size> {d} and <hbm.size> {h} are mutually exclusive"))
            }
            (d, _) if d > 0 && d % DRAM_SIZE_ALIGNMENT != 0 => {
                errors.push(format!("<dram.size> {d} is not 2MiB-aligned"))
            }
            _ => {}
        }
        self.tls.validate(&mut errors);
        errors
    }

    /// The tier this rank contributes.
    pub fn media_type(&self) -> crate::types::MediaType {
        if self.hbm_size > 0 {
            crate::types::MediaType::Hbm
        } else {
            crate::types::MediaType::Dram
        }
    }

    /// Capacity of the contributed segment, whichever tier it is.
    pub fn segment_size(&self) -> u64 {
        self.dram_size + self.hbm_size
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub meta_service_url: String,
    pub rank_id: u32,
    pub auto_ranking: u8,
    /// RPC timeout in seconds.
    pub timeout_seconds: u32,
    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            meta_service_url: "tcp://127.0.0.1:5000".into(),
            rank_id: 0,
            auto_ranking: 0,
            timeout_seconds: RPC_TIMEOUT_SECS,
            tls: TlsConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if parse_tcp_url(&self.meta_service_url).is_none() {
            errors.push(format!(
                "<meta_service_url> `{}` is not a tcp://ip:port url",
                self.meta_service_url
            ));
        }
        if self.timeout_seconds == 0 {
            errors.push("<timeout_seconds> must be positive".into());
        }
        self.tls.validate(&mut errors);
        errors
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .map_err(|e| MmcError::InvalidParam(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| MmcError::InvalidParam(format!("bad config: {e}")))
}

/// Split a `tcp://ip:port` url into `(ip, port)`.
pub fn parse_tcp_url(url: &str) -> Option<(String, u16)> {
    let rest = url.trim().strip_prefix("tcp://")?;
    let (ip, port) = rest.rsplit_once(':')?;
    if ip.is_empty() {
        return None;
    }
    // v4 dotted quad only; the fabric addresses ranks by v4.
    if ip != "localhost" {
        let octets: Vec<&str> = ip.split('.').collect();
        if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
            return None;
        }
    }
    let port: u16 = port.parse().ok()?;
    Some((ip.to_owned(), port))
}

/// Map a config log level to the facade's filter.
pub fn log_level_of(level: &str) -> Option<log::LevelFilter> {
    match level {
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warn" => Some(log::LevelFilter::Warn),
        "error" => Some(log::LevelFilter::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_url_parsing() {
        assert_eq!(parse_tcp_url("tcp://127.0.0.1:5000"), Some(("127.0.0.1".into(), 5000)));
        assert!(parse_tcp_url("tcp://300.0.0.1:5000").is_none());
        assert!(parse_tcp_url("udp://127.0.0.1:5000").is_none());
        assert!(parse_tcp_url("tcp://127.0.0.1").is_none());
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut cfg = MetaServiceConfig::default();
        assert!(cfg.validate().is_empty());
        cfg.evict_threshold_high = 50;
        cfg.evict_threshold_low = 60;
        assert!(!cfg.validate().is_empty());
    }

    #[test]
    fn dram_and_hbm_are_exclusive() {
        let mut cfg = LocalServiceConfig::default();
        assert!(cfg.validate().is_empty());
        cfg.hbm_size = 4096;
        assert!(!cfg.validate().is_empty());
        cfg.dram_size = 0;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn dram_must_be_huge_page_aligned() {
        let mut cfg = LocalServiceConfig::default();
        cfg.dram_size = DRAM_SIZE_ALIGNMENT + 4096;
        assert!(!cfg.validate().is_empty());
    }
}
