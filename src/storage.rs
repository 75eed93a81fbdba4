//! Backend secrets in the OS credential store.
//!
//! On Windows this uses the Credential Manager, on macOS Keychain, and on
//! Linux the kernel keyutils store (via the `keyring` crate). Only secrets
//! live here; plain connection settings stay in `local_settings`.

use keyring::Entry;
use tracing::{info, warn};

const SERVICE_NAME: &str = "pos-einvoicing";

/// API key (or password) used for backend `execute_kw` calls.
pub const KEY_BACKEND_API_KEY: &str = "backend_api_key";

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    info!(key, "keyring: credential stored");
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}
