use std::env;
use std::sync::Arc;

use log::{info, warn};

use crate::engine::{MemStore, Persistence};
use crate::sdk::Client;
use crate::{CelerixStore, Result};

/// Initializes a [`CelerixStore`] based on the environment.
///
/// 1. If `CELERIX_STORE_ADDR` is set and non-empty, connect to that address
///    in **remote mode** (TLS unless `CELERIX_DISABLE_TLS=true`).
/// 2. On connect failure, or when the variable is absent, fall back to
///    **embedded mode**: a [`MemStore`] persisted under `data_dir`.
///
/// # Examples
///
/// ```no_run
/// use celerix_store::sdk;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let store = sdk::new("./data").await?;
///     Ok(())
/// }
/// ```
pub async fn new(data_dir: &str) -> Result<Arc<dyn CelerixStore>> {
    if let Ok(addr) = env::var("CELERIX_STORE_ADDR") {
        if !addr.is_empty() {
            match Client::connect(&addr).await {
                Ok(client) => {
                    info!("using remote store at {addr}");
                    return Ok(Arc::new(client));
                }
                Err(e) => {
                    warn!("could not reach remote store at {addr}: {e}; falling back to embedded mode");
                }
            }
        }
    }

    let persistence = Arc::new(Persistence::new(data_dir)?);
    let initial_data = persistence.load_all()?;
    let store = MemStore::new(initial_data, Some(persistence));
    Ok(Arc::new(store))
}
