use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

const SESSION_ALIAS: &str = "session";

/// Credentials handed over from a logged-in browser session. The backend
/// spells the field `sessionId` on every surface, including storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub username: String,
}

#[derive(Clone)]
pub struct SessionStore {
    service_name: String,
    backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SessionStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: StoreBackend::Keyring,
        }
    }

    /// Process-local store with no OS keychain behind it, for tests and dry
    /// runs.
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: StoreBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn set(&self, session: &StoredSession) -> AppResult<()> {
        let payload = SecretString::new(serde_json::to_string(session)?.into());
        self.store(SESSION_ALIAS, &payload)?;
        info!(
            target: "session_store",
            service = %self.service_name,
            username = %session.username,
            "stored session in secure backend"
        );
        Ok(())
    }

    pub fn get(&self) -> AppResult<Option<StoredSession>> {
        let Some(raw) = self.try_get(SESSION_ALIAS)? else {
            return Ok(None);
        };
        match serde_json::from_str(raw.expose_secret()) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(
                    target: "session_store",
                    ?err,
                    "stored session is unreadable, treating as logged out"
                );
                Ok(None)
            }
        }
    }

    /// Like [`get`](Self::get) but failing when nobody is logged in.
    pub fn require(&self) -> AppResult<StoredSession> {
        self.get()?.ok_or(AppError::NoSession)
    }

    pub fn has(&self) -> AppResult<bool> {
        self.try_get(SESSION_ALIAS).map(|raw| raw.is_some())
    }

    pub fn clear(&self) -> AppResult<()> {
        match &self.backend {
            StoreBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, SESSION_ALIAS)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(err) => return Err(AppError::from(err)),
                }
            }
            StoreBackend::Memory(store) => {
                store.lock().remove(SESSION_ALIAS);
            }
        }
        debug!(target: "session_store", service = %self.service_name, "cleared session");
        Ok(())
    }

    fn try_get(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            StoreBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::new(value.into()))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            StoreBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    fn store(&self, account: &str, payload: &SecretString) -> AppResult<()> {
        match &self.backend {
            StoreBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(payload.expose_secret())?;
                Ok(())
            }
            StoreBackend::Memory(store) => {
                store.lock().insert(account.to_string(), payload.clone());
                Ok(())
            }
        }
    }
}
