use std::sync::Arc;

use celerix_store::engine::{vault, MemStore, Persistence};
use celerix_store::server::Router;
use celerix_store::AppEnumeration;
use clap::Parser;
use log::{error, info, warn};
use tokio::signal;

/// Celerix Store daemon: serves the line protocol over TCP/TLS.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory for persona JSON files.
    #[arg(short, long, env = "CELERIX_DATA_DIR", default_value = "data")]
    data_dir: String,

    /// TCP port to listen on.
    #[arg(short, long, env = "CELERIX_PORT", default_value = "7001")]
    port: String,

    /// Serve plain TCP instead of TLS.
    #[arg(long, env = "CELERIX_DISABLE_TLS")]
    disable_tls: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let persistence = Arc::new(Persistence::new(&args.data_dir)?);
    let initial_data = match persistence.load_all() {
        Ok(data) => data,
        Err(e) => {
            warn!("could not load existing data: {e}");
            Default::default()
        }
    };

    let store = Arc::new(MemStore::new(initial_data, Some(persistence)));
    info!(
        "engine started, loaded {} personas",
        store.get_personas().await?.len()
    );

    let mut router = Router::new(store.clone());
    if args.disable_tls {
        info!("tls disabled, serving plain tcp");
    } else {
        let (cert, key) = vault::generate_self_signed_cert()?;
        router.set_certificate(cert, key)?;
        info!("tls enabled with a self-signed certificate");
    }

    tokio::select! {
        res = router.listen(&args.port) => {
            if let Err(e) = res {
                error!("tcp server failed: {e}");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received, finalizing disk writes");
            store.wait().await;
            info!("persistence complete, exiting");
        }
    }

    Ok(())
}
