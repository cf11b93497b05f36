//! Supervisor preferences.
//!
//! A small key/value store on disk (JSON) supplying network addressing
//! and protocol tunables. Missing keys take their defaults, so an empty
//! file is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::net::{DEFAULT_PEER_TIMEOUT_MS, DEFAULT_STATUS_INTERVAL_MS};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    /// The 16-bit system identifier reported in system-status capsules.
    pub system_id: u16,

    /// Address and port on which to listen for host capsules.
    pub bind_addr: String,

    /// Period between status batches to each peer, in ms.
    pub status_interval_ms: u32,

    /// Time after which a silent peer is dropped, in ms.
    pub peer_timeout_ms: u32,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            system_id: 0,
            bind_addr: "0.0.0.0:40000".to_owned(),
            status_interval_ms: DEFAULT_STATUS_INTERVAL_MS,
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
        }
    }
}

impl Prefs {
    /// Load preferences from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read preferences {}: {e}", path.display()))?;
        serde_json::from_str(&text)
            .map_err(|e| format!("Failed to parse preferences {}: {e}", path.display()))
    }
}
