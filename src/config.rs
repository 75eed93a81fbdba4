//! Terminal configuration.
//!
//! Settings come from the `local_settings` store (`backend`, `hardware`,
//! `finalize` categories); the backend API key comes from the OS credential
//! store with a local-setting fallback. A connection string can supply any
//! backend coordinate that is not set individually.

use rusqlite::Connection;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{decode_connection_string, normalize_backend_url, ConnectionInfo};
use crate::db::{self, DbState};
use crate::drawer::{DrawerMode, DEFAULT_DRAWER_PORT};
use crate::storage;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("settings store unavailable: {0}")]
    Store(String),
    #[error("missing setting {category}.{key}")]
    Missing {
        category: &'static str,
        key: &'static str,
    },
    #[error("invalid value {value:?} for {category}.{key}")]
    Invalid {
        category: &'static str,
        key: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub url: String,
    pub database: String,
    pub login: String,
    pub api_key: String,
}

/// Retry budget for the post-submission invoice lookup. A zero
/// `max_elapsed` means a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupRetry {
    pub max_elapsed: Duration,
    pub initial_interval: Duration,
}

impl LookupRetry {
    pub fn disabled() -> Self {
        Self {
            max_elapsed: Duration::ZERO,
            initial_interval: Duration::from_millis(250),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.max_elapsed.is_zero()
    }
}

impl Default for LookupRetry {
    fn default() -> Self {
        Self::disabled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FinalizeSettings {
    /// Session hardware flag: a cash drawer is attached.
    pub iface_cashdrawer: bool,
    pub lookup_retry: LookupRetry,
    /// Wait for the plain-sale submission before looking up the order.
    pub await_plain_push: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosConfig {
    pub backend: BackendSettings,
    pub drawer_mode: DrawerMode,
    pub finalize: FinalizeSettings,
}

fn setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    db::get_setting(conn, category, key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn bool_setting(
    conn: &Connection,
    category: &'static str,
    key: &'static str,
) -> Result<bool, ConfigError> {
    match setting(conn, category, key) {
        None => Ok(false),
        Some(v) => parse_bool(&v).ok_or(ConfigError::Invalid {
            category,
            key,
            value: v,
        }),
    }
}

fn number_setting<T: std::str::FromStr>(
    conn: &Connection,
    category: &'static str,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match setting(conn, category, key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            category,
            key,
            value: v,
        }),
    }
}

impl PosConfig {
    /// Load the configuration, reading the API key from the OS keyring.
    pub fn load(db: &DbState) -> Result<Self, ConfigError> {
        Self::load_with_secret(db, storage::get_credential(storage::KEY_BACKEND_API_KEY))
    }

    /// Load the configuration with an already-resolved API key (if any).
    pub fn load_with_secret(db: &DbState, api_key: Option<String>) -> Result<Self, ConfigError> {
        let conn = db.conn.lock().map_err(|e| ConfigError::Store(e.to_string()))?;

        let packed = setting(&conn, "backend", "connection_string")
            .and_then(|raw| decode_connection_string(&raw))
            .unwrap_or_default();

        let url = setting(&conn, "backend", "url")
            .map(|u| normalize_backend_url(&u))
            .or(packed.url)
            .ok_or(ConfigError::Missing {
                category: "backend",
                key: "url",
            })?;
        let database = setting(&conn, "backend", "database")
            .or(packed.db)
            .ok_or(ConfigError::Missing {
                category: "backend",
                key: "database",
            })?;
        let login = setting(&conn, "backend", "login")
            .or(packed.login)
            .ok_or(ConfigError::Missing {
                category: "backend",
                key: "login",
            })?;
        let api_key = api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .or_else(|| setting(&conn, "backend", "api_key"))
            .or(packed.key)
            .ok_or(ConfigError::Missing {
                category: "backend",
                key: "api_key",
            })?;

        let drawer_mode = match setting(&conn, "hardware", "drawer_mode").as_deref() {
            None | Some("none") => DrawerMode::None,
            Some("escpos_tcp") => DrawerMode::EscposTcp {
                host: setting(&conn, "hardware", "drawer_host").ok_or(ConfigError::Missing {
                    category: "hardware",
                    key: "drawer_host",
                })?,
                port: number_setting(&conn, "hardware", "drawer_port", DEFAULT_DRAWER_PORT)?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    category: "hardware",
                    key: "drawer_mode",
                    value: other.to_string(),
                })
            }
        };

        let initial_interval_ms =
            number_setting(&conn, "finalize", "lookup_initial_interval_ms", 250u64)?;
        if initial_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                category: "finalize",
                key: "lookup_initial_interval_ms",
                value: "0".to_string(),
            });
        }

        let finalize = FinalizeSettings {
            iface_cashdrawer: bool_setting(&conn, "hardware", "iface_cashdrawer")?,
            lookup_retry: LookupRetry {
                max_elapsed: Duration::from_millis(number_setting(
                    &conn,
                    "finalize",
                    "lookup_max_elapsed_ms",
                    0u64,
                )?),
                initial_interval: Duration::from_millis(initial_interval_ms),
            },
            await_plain_push: bool_setting(&conn, "finalize", "await_plain_push")?,
        };

        if finalize.iface_cashdrawer && drawer_mode == DrawerMode::None {
            warn!("iface_cashdrawer is enabled but no drawer_mode is configured");
        }

        Ok(Self {
            backend: BackendSettings {
                url,
                database,
                login,
                api_key,
            },
            drawer_mode,
            finalize,
        })
    }
}

/// Write the non-secret backend coordinates of a connection string.
fn persist_connection(conn: &Connection, info: &ConnectionInfo) -> Result<(), ConfigError> {
    let pairs = [
        ("url", info.url.as_deref()),
        ("database", info.db.as_deref()),
        ("login", info.login.as_deref()),
    ];
    for (key, value) in pairs {
        if let Some(value) = value {
            db::set_setting(conn, "backend", key, value).map_err(ConfigError::Store)?;
        }
    }
    Ok(())
}

/// Onboard a terminal from a connection string: coordinates go to the
/// settings store, the key to the OS keyring (local setting if the keyring
/// is unavailable).
pub fn store_connection_string(db: &DbState, raw: &str) -> Result<ConnectionInfo, ConfigError> {
    let info = decode_connection_string(raw).ok_or(ConfigError::Invalid {
        category: "backend",
        key: "connection_string",
        value: "<undecodable>".to_string(),
    })?;

    let conn = db.conn.lock().map_err(|e| ConfigError::Store(e.to_string()))?;
    persist_connection(&conn, &info)?;

    if let Some(key) = info.key.as_deref() {
        if let Err(e) = storage::set_credential(storage::KEY_BACKEND_API_KEY, key) {
            warn!(error = %e, "keyring unavailable, keeping backend key in local settings");
            db::set_setting(&conn, "backend", "api_key", key).map_err(ConfigError::Store)?;
        }
    }

    info!(url = ?info.url, database = ?info.db, "backend connection stored");
    Ok(info)
}
