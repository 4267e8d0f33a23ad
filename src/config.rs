// Copyright 2020 Joyent, Inc.

//! Server configuration, read from JSON.

use std::fs;
use std::path::Path;

use serde_derive::Deserialize;

use crate::codec::Endian;
use crate::error::{DapError, Result};
use crate::protocol::MAX_CHUNK_SIZE;

pub const DEFAULT_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Native,
    Little,
    Big,
}

impl ByteOrder {
    pub fn endian(self) -> Endian {
        match self {
            ByteOrder::Native => Endian::native(),
            ByteOrder::Little => Endian::Little,
            ByteOrder::Big => Endian::Big,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DapConfig {
    /// Most dataset handles kept open at once.
    pub cache_capacity: usize,
    /// Payload bytes per DATA chunk.
    pub chunk_size: usize,
    /// Cap on the payload bytes of one response.
    pub write_limit: Option<u64>,
    /// Checksum data responses unless the request says otherwise.
    pub checksum: bool,
    /// Payload byte order unless the request says otherwise.
    pub byte_order: ByteOrder,
    /// Advertised in the capabilities document.
    pub server_name: String,
}

impl Default for DapConfig {
    fn default() -> DapConfig {
        DapConfig {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_limit: None,
            checksum: false,
            byte_order: ByteOrder::Native,
            server_name: concat!("dap4-encoder/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DapConfig {
    pub fn from_json(text: &str) -> Result<DapConfig> {
        let config: DapConfig = serde_json::from_str(text)
            .map_err(|e| DapError::bad_request(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<DapConfig> {
        let text = fs::read_to_string(path)?;
        DapConfig::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(DapError::bad_request("cache_capacity must be at least 1"));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(DapError::bad_request(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = DapConfig::from_json("{}").unwrap();
        assert_eq!(config, DapConfig::default());
        assert_eq!(config.cache_capacity, 16);
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.write_limit, None);
        assert_eq!(config.byte_order.endian(), Endian::native());
    }

    #[test]
    fn overrides() {
        let config = DapConfig::from_json(
            r#"{"cache_capacity": 2, "checksum": true, "byte_order": "big",
                "write_limit": 1024, "server_name": "test"}"#,
        )
        .unwrap();
        assert_eq!(config.cache_capacity, 2);
        assert!(config.checksum);
        assert_eq!(config.byte_order, ByteOrder::Big);
        assert_eq!(config.write_limit, Some(1024));
        assert_eq!(config.server_name, "test");
    }

    #[test]
    fn invalid() {
        assert!(DapConfig::from_json(r#"{"cache_capacity": 0}"#).is_err());
        assert!(DapConfig::from_json(r#"{"chunk_size": 0}"#).is_err());
        assert!(DapConfig::from_json(r#"{"chunk_size": 16777216}"#).is_err());
        assert!(DapConfig::from_json(r#"{"byte_order": "middle"}"#).is_err());
        assert!(DapConfig::from_json(r#"{"bogus": 1}"#).is_err());
    }
}
