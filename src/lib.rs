//! Celerix Store: an in-memory, persisted key-value store with a
//! Persona → App → Key namespace.
//!
//! The store runs in one of two interchangeable modes behind the same trait
//! surface: embedded ([`engine::MemStore`] owning RAM and disk state) or
//! remote ([`sdk::Client`] speaking the line protocol to a daemon over
//! TCP/TLS). [`sdk::new`] picks the mode from the environment.

pub mod engine;
pub mod sdk;
pub mod server;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Key → value map of a single app namespace.
pub type AppData = HashMap<String, serde_json::Value>;
/// App → key → value subtree of a single persona. The unit of persistence.
pub type PersonaData = HashMap<String, AppData>;
/// The full three-tier map: persona → app → key → value.
pub type StoreData = HashMap<String, PersonaData>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("persona not found")]
    PersonaNotFound,
    #[error("app not found")]
    AppNotFound,
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid key size: got {0} bytes, want 32")]
    InvalidKeySize(usize),
    #[error("malformed hex ciphertext: {0}")]
    MalformedHex(hex::FromHexError),
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("decryption failed (wrong key or tampered data)")]
    DecryptionFailed,
    /// An `ERR` reply from the daemon that does not map to an engine error.
    #[error("{0}")]
    Remote(String),
    #[error("failed after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Maps the message of a daemon `ERR` reply back onto the engine
    /// taxonomy, so remote and embedded callers match on the same variants.
    pub(crate) fn from_wire(msg: &str) -> Self {
        match msg {
            "persona not found" => Error::PersonaNotFound,
            "app not found" => Error::AppNotFound,
            "key not found" => Error::KeyNotFound,
            _ => Error::Remote(msg.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reserved persona for system-level data. No special behavior in the core,
/// but consumers rely on its stable identity.
pub const SYSTEM_PERSONA: &str = "_system";

#[async_trait]
pub trait KVReader: Send + Sync {
    async fn get(&self, persona_id: &str, app_id: &str, key: &str) -> Result<serde_json::Value>;
}

#[async_trait]
pub trait KVWriter: Send + Sync {
    async fn set(
        &self,
        persona_id: &str,
        app_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()>;
    async fn delete(&self, persona_id: &str, app_id: &str, key: &str) -> Result<()>;
}

#[async_trait]
pub trait AppEnumeration: Send + Sync {
    async fn get_personas(&self) -> Result<Vec<String>>;
    async fn get_apps(&self, persona_id: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait BatchExporter: Send + Sync {
    async fn get_app_store(&self, persona_id: &str, app_id: &str) -> Result<AppData>;
    async fn dump_app(&self, app_id: &str) -> Result<HashMap<String, AppData>>;
}

#[async_trait]
pub trait GlobalSearcher: Send + Sync {
    async fn get_global(&self, app_id: &str, key: &str) -> Result<(serde_json::Value, String)>;
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn move_key(
        &self,
        src_persona: &str,
        dst_persona: &str,
        app_id: &str,
        key: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait CelerixStore:
    KVReader + KVWriter + AppEnumeration + BatchExporter + GlobalSearcher + Orchestrator
{
    fn app(&self, persona_id: &str, app_id: &str) -> Box<dyn AppScope + '_>;
}

/// A scope that pins the persona and app so per-key calls need not repeat them.
#[async_trait]
pub trait AppScope: Send + Sync {
    async fn get(&self, key: &str) -> Result<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    fn vault(&self, master_key: &[u8]) -> Box<dyn VaultScope + '_>;
}

/// An [`AppScope`] that transparently encrypts values with AES-GCM-256
/// before they leave the caller.
#[async_trait]
pub trait VaultScope: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
    async fn set(&self, key: &str, plaintext: &str) -> Result<()>;
}
