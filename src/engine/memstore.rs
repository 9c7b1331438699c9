use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::engine::{vault, Persistence};
use crate::{
    AppData, AppEnumeration, AppScope, BatchExporter, CelerixStore, Error, GlobalSearcher,
    KVReader, KVWriter, Orchestrator, PersonaData, Result, StoreData, VaultScope,
};

/// Thread-safe in-memory store with asynchronous per-persona persistence.
///
/// Every mutation commits under the write lock, deep-copies the affected
/// persona subtree while still holding it, and enqueues the copy onto that
/// persona's ordered writer queue. Channel order therefore equals commit
/// order, and the on-disk file converges to the latest committed snapshot.
pub struct MemStore {
    data: RwLock<StoreData>,
    persister: Option<Arc<Persistence>>,
    // One writer task per persona, created lazily on first dispatch.
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<PersonaData>>>,
    pending: Arc<AtomicUsize>,
}

impl MemStore {
    /// Initializes a store from existing data (usually [`Persistence::load_all`])
    /// and an optional persister. Without a persister the store is RAM-only.
    pub fn new(initial_data: StoreData, persister: Option<Arc<Persistence>>) -> Self {
        Self {
            data: RwLock::new(initial_data),
            persister,
            writers: Mutex::new(HashMap::new()),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Blocks until every queued and in-flight persistence task has drained.
    pub async fn wait(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Hands a persona snapshot to its writer task.
    ///
    /// Must be called while the caller still holds the `data` write lock:
    /// enqueue order is what keeps the disk state monotonic.
    fn dispatch_save(&self, persona_id: &str, snapshot: PersonaData) {
        let Some(persister) = &self.persister else {
            return;
        };

        let mut writers = self.writers.lock().unwrap();
        let tx = writers.entry(persona_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(persona_writer(
                persona_id.to_string(),
                rx,
                persister.clone(),
                self.pending.clone(),
            ));
            tx
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(snapshot).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub async fn get_generic<T: DeserializeOwned>(
        &self,
        persona_id: &str,
        app_id: &str,
        key: &str,
    ) -> Result<T> {
        let val = self.get(persona_id, app_id, key).await?;
        Ok(serde_json::from_value(val)?)
    }

    pub async fn set_generic<T: Serialize + Send>(
        &self,
        persona_id: &str,
        app_id: &str,
        key: &str,
        value: T,
    ) -> Result<()> {
        let val = serde_json::to_value(value)?;
        self.set(persona_id, app_id, key, val).await
    }
}

/// Consumes snapshots for one persona in dispatch order, coalescing the
/// queue down to the newest snapshot before each disk write.
async fn persona_writer(
    persona_id: String,
    mut rx: mpsc::UnboundedReceiver<PersonaData>,
    persister: Arc<Persistence>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(mut snapshot) = rx.recv().await {
        let mut batch = 1;
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
            batch += 1;
        }

        let p = persister.clone();
        let id = persona_id.clone();
        match tokio::task::spawn_blocking(move || p.save_persona(&id, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to persist persona {persona_id}: {e}"),
            Err(e) => error!("persistence task for persona {persona_id} panicked: {e}"),
        }
        pending.fetch_sub(batch, Ordering::SeqCst);
    }
}

#[async_trait]
impl KVReader for MemStore {
    async fn get(&self, persona_id: &str, app_id: &str, key: &str) -> Result<serde_json::Value> {
        let data = self.data.read().unwrap();
        data.get(persona_id)
            .ok_or(Error::PersonaNotFound)?
            .get(app_id)
            .ok_or(Error::AppNotFound)?
            .get(key)
            .cloned()
            .ok_or(Error::KeyNotFound)
    }
}

#[async_trait]
impl KVWriter for MemStore {
    async fn set(
        &self,
        persona_id: &str,
        app_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut data = self.data.write().unwrap();
        let persona = data.entry(persona_id.to_string()).or_default();
        persona
            .entry(app_id.to_string())
            .or_default()
            .insert(key.to_string(), value);

        let snapshot = persona.clone();
        self.dispatch_save(persona_id, snapshot);
        Ok(())
    }

    /// Removes a key. Deleting through a missing persona, app, or key is a
    /// silent no-op.
    async fn delete(&self, persona_id: &str, app_id: &str, key: &str) -> Result<()> {
        let mut data = self.data.write().unwrap();
        if let Some(persona) = data.get_mut(persona_id) {
            if let Some(app) = persona.get_mut(app_id) {
                app.remove(key);
            }
            let snapshot = persona.clone();
            self.dispatch_save(persona_id, snapshot);
        }
        Ok(())
    }
}

#[async_trait]
impl AppEnumeration for MemStore {
    async fn get_personas(&self) -> Result<Vec<String>> {
        let data = self.data.read().unwrap();
        Ok(data.keys().cloned().collect())
    }

    async fn get_apps(&self, persona_id: &str) -> Result<Vec<String>> {
        let data = self.data.read().unwrap();
        Ok(data
            .get(persona_id)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl BatchExporter for MemStore {
    async fn get_app_store(&self, persona_id: &str, app_id: &str) -> Result<AppData> {
        let data = self.data.read().unwrap();
        data.get(persona_id)
            .and_then(|p| p.get(app_id))
            .cloned()
            .ok_or(Error::AppNotFound)
    }

    async fn dump_app(&self, app_id: &str) -> Result<HashMap<String, AppData>> {
        let data = self.data.read().unwrap();
        let mut result = HashMap::new();
        for (persona_id, apps) in data.iter() {
            if let Some(app_data) = apps.get(app_id) {
                result.insert(persona_id.clone(), app_data.clone());
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl GlobalSearcher for MemStore {
    async fn get_global(&self, app_id: &str, key: &str) -> Result<(serde_json::Value, String)> {
        let data = self.data.read().unwrap();
        // Lexicographically smallest persona wins so lookups stay stable
        // across map iteration orders.
        let mut found: Option<(&String, &serde_json::Value)> = None;
        for (persona_id, apps) in data.iter() {
            if let Some(val) = apps.get(app_id).and_then(|a| a.get(key)) {
                match found {
                    Some((best, _)) if best <= persona_id => {}
                    _ => found = Some((persona_id, val)),
                }
            }
        }
        found
            .map(|(persona_id, val)| (val.clone(), persona_id.clone()))
            .ok_or(Error::KeyNotFound)
    }
}

#[async_trait]
impl Orchestrator for MemStore {
    /// Moves a key between personas in a single critical section: either
    /// the whole transfer commits or nothing does.
    async fn move_key(
        &self,
        src_persona: &str,
        dst_persona: &str,
        app_id: &str,
        key: &str,
    ) -> Result<()> {
        let mut data = self.data.write().unwrap();

        let val = {
            let src = data.get_mut(src_persona).ok_or(Error::PersonaNotFound)?;
            let src_app = src.get_mut(app_id).ok_or(Error::AppNotFound)?;
            src_app.remove(key).ok_or(Error::KeyNotFound)?
        };

        data.entry(dst_persona.to_string())
            .or_default()
            .entry(app_id.to_string())
            .or_default()
            .insert(key.to_string(), val);

        if let Some(snapshot) = data.get(src_persona).cloned() {
            self.dispatch_save(src_persona, snapshot);
        }
        if let Some(snapshot) = data.get(dst_persona).cloned() {
            self.dispatch_save(dst_persona, snapshot);
        }
        Ok(())
    }
}

impl CelerixStore for MemStore {
    fn app(&self, persona_id: &str, app_id: &str) -> Box<dyn AppScope + '_> {
        Box::new(MemAppScope {
            store: self,
            persona_id: persona_id.to_string(),
            app_id: app_id.to_string(),
        })
    }
}

pub struct MemAppScope<'a> {
    store: &'a MemStore,
    persona_id: String,
    app_id: String,
}

#[async_trait]
impl<'a> AppScope for MemAppScope<'a> {
    async fn get(&self, key: &str) -> Result<serde_json::Value> {
        self.store.get(&self.persona_id, &self.app_id, key).await
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.store
            .set(&self.persona_id, &self.app_id, key, value)
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.persona_id, &self.app_id, key).await
    }

    fn vault(&self, master_key: &[u8]) -> Box<dyn VaultScope + '_> {
        Box::new(MemVaultScope {
            app: self,
            master_key: master_key.to_vec(),
        })
    }
}

pub struct MemVaultScope<'a> {
    app: &'a MemAppScope<'a>,
    master_key: Vec<u8>,
}

#[async_trait]
impl<'a> VaultScope for MemVaultScope<'a> {
    async fn get(&self, key: &str) -> Result<String> {
        let val = self.app.get(key).await?;
        let cipher_hex = val
            .as_str()
            .ok_or_else(|| Error::Internal("vault data is not a string".to_string()))?;
        vault::decrypt(cipher_hex, &self.master_key)
    }

    async fn set(&self, key: &str, plaintext: &str) -> Result<()> {
        let cipher_hex = vault::encrypt(plaintext, &self.master_key)?;
        self.app
            .set(key, serde_json::Value::String(cipher_hex))
            .await
    }
}
