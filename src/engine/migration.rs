use log::info;

use crate::{CelerixStore, Error, Result};

/// Copies every key from a source store into a destination store.
///
/// Works in both directions across modes: embedded → remote (the upgrade
/// path) and remote → embedded (backup / offline). The first failed write
/// aborts the migration with the offending coordinates in the error.
pub async fn migrate(src: &dyn CelerixStore, dst: &dyn CelerixStore) -> Result<()> {
    let personas = src.get_personas().await?;

    for persona_id in &personas {
        let apps = src.get_apps(persona_id).await?;
        for app_id in &apps {
            let data = src.get_app_store(persona_id, app_id).await?;
            for (key, value) in data {
                dst.set(persona_id, app_id, &key, value).await.map_err(|e| {
                    Error::Internal(format!(
                        "migration failed at {persona_id}/{app_id}/{key}: {e}"
                    ))
                })?;
            }
        }
    }

    info!("migrated {} personas", personas.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemStore;
    use crate::{AppEnumeration, KVReader, KVWriter, StoreData};
    use serde_json::json;

    #[tokio::test]
    async fn test_migrate_between_stores() {
        let src = MemStore::new(StoreData::new(), None);
        src.set("p1", "a1", "k1", json!("v1")).await.unwrap();
        src.set("p1", "a2", "k2", json!({"x": 1})).await.unwrap();
        src.set("p2", "a1", "k3", json!([1, 2])).await.unwrap();

        let dst = MemStore::new(StoreData::new(), None);
        migrate(&src, &dst).await.unwrap();

        assert_eq!(dst.get("p1", "a1", "k1").await.unwrap(), json!("v1"));
        assert_eq!(dst.get("p1", "a2", "k2").await.unwrap(), json!({"x": 1}));
        assert_eq!(dst.get("p2", "a1", "k3").await.unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_migrate_empty_source() {
        let src = MemStore::new(StoreData::new(), None);
        let dst = MemStore::new(StoreData::new(), None);
        migrate(&src, &dst).await.unwrap();
        assert!(dst.get_personas().await.unwrap().is_empty());
    }
}
