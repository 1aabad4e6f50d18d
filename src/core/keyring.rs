//! API keys stored in the platform keyring.
//!
//! Each service's key lives under the `murmur` keyring service with the
//! service id as the user name.

use std::error::Error;
use std::fmt;

use tracing::debug;

const KEYRING_SERVICE: &str = "murmur";

/// Describes failures when attempting to access the system keyring.
///
/// Recoverable errors indicate that the credential backend was
/// temporarily unavailable (for example when the keychain is locked).
/// Permanent errors surface the underlying cause directly.
#[derive(Debug)]
pub enum KeyringAccessError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
}

impl KeyringAccessError {
    fn inner(&self) -> &keyring::Error {
        match self {
            KeyringAccessError::Recoverable(err) | KeyringAccessError::Permanent(err) => err,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, KeyringAccessError::Recoverable(_))
    }
}

impl From<keyring::Error> for KeyringAccessError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                KeyringAccessError::Recoverable(err)
            }
            other => KeyringAccessError::Permanent(other),
        }
    }
}

impl fmt::Display for KeyringAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keyring access failed: {}", self.inner())
    }
}

impl Error for KeyringAccessError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.inner())
    }
}

fn entry(service_id: &str) -> Result<keyring::Entry, KeyringAccessError> {
    Ok(keyring::Entry::new(
        KEYRING_SERVICE,
        &service_id.to_ascii_lowercase(),
    )?)
}

/// Look up the stored key for `service_id`. A missing entry is `Ok(None)`.
pub fn get_api_key(service_id: &str) -> Result<Option<String>, KeyringAccessError> {
    match entry(service_id)?.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn store_api_key(service_id: &str, api_key: &str) -> Result<(), KeyringAccessError> {
    entry(service_id)?.set_password(api_key)?;
    debug!(service = service_id, "Stored API key in keyring");
    Ok(())
}

/// Remove the stored key. Returns `false` when there was nothing to remove.
pub fn delete_api_key(service_id: &str) -> Result<bool, KeyringAccessError> {
    match entry(service_id)?.delete_credential() {
        Ok(()) => Ok(true),
        Err(keyring::Error::NoEntry) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_failures_are_recoverable() {
        let err: KeyringAccessError =
            keyring::Error::PlatformFailure("locked".to_string().into()).into();
        assert!(err.is_recoverable());
        assert!(err.source().is_some());

        let err: KeyringAccessError = keyring::Error::NoEntry.into();
        assert!(!err.is_recoverable());
        assert!(err.to_string().starts_with("keyring access failed: "));
    }
}
