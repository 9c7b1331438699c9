use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::{self, Instant};
use tokio_rustls::TlsAcceptor;

use crate::{CelerixStore, Error, Result};

/// Maximum number of concurrently running connection handlers.
const MAX_CONNECTIONS: usize = 100;
/// Overall lifetime of a connection, counted from accept.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Deadline for each command read within the loop.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Line-protocol TCP server for the store daemon.
///
/// Handlers are admitted through a counting semaphore: the listener keeps
/// accepting, but at most [`MAX_CONNECTIONS`] command loops run at a time.
pub struct Router {
    store: Arc<dyn CelerixStore>,
    tls: Option<TlsAcceptor>,
    semaphore: Arc<Semaphore>,
}

impl Router {
    pub fn new(store: Arc<dyn CelerixStore>) -> Self {
        Self {
            store,
            tls: None,
            semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Attaches a TLS certificate; the listener is wrapped in TLS from then on.
    pub fn set_certificate(
        &mut self,
        cert: CertificateDer<'static>,
        key: PrivatePkcs8KeyDer<'static>,
    ) -> Result<()> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key.into())
            .map_err(|e| Error::Tls(e.to_string()))?;
        self.tls = Some(TlsAcceptor::from(Arc::new(config)));
        Ok(())
    }

    /// Binds the given port and serves until the future is dropped.
    pub async fn listen(&self, port: &str) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!(
            "celerix store listening on port {port} ({})",
            if self.tls.is_some() { "tls" } else { "plain tcp" }
        );
        self.serve(listener).await
    }

    /// Accepts connections on an already-bound listener until the future is
    /// dropped (graceful shutdown drops it and then drains the engine).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            let store = self.store.clone();
            let sem = self.semaphore.clone();
            let tls = self.tls.clone();

            tokio::spawn(async move {
                // Admission gate. The connection is accepted but its command
                // loop waits here until a handler slot frees up.
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };

                let res = match tls {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(stream) => handle_connection(stream, store).await,
                        Err(e) => {
                            debug!("tls handshake with {peer} failed: {e}");
                            return;
                        }
                    },
                    None => handle_connection(socket, store).await,
                };
                if let Err(e) = res {
                    debug!("connection from {peer} closed with error: {e}");
                }
            });
        }
    }
}

/// Runs the command loop for one connection until `QUIT`, peer close, or a
/// deadline elapses.
///
/// One command per `\n`-terminated line, tokens split on whitespace, one
/// reply line per command. Truncated and unknown commands produce no reply;
/// the loop simply continues.
pub async fn handle_connection<S>(stream: S, store: Arc<dyn CelerixStore>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + CONNECTION_DEADLINE;
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("connection deadline elapsed");
            return Ok(());
        }

        line.clear();
        let n = match time::timeout(remaining.min(READ_TIMEOUT), reader.read_line(&mut line)).await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("read deadline elapsed");
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(()); // peer closed
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        let command = parts[0].to_uppercase();

        let response = match command.as_str() {
            "GET" => {
                if parts.len() < 4 {
                    continue;
                }
                match store.get(parts[1], parts[2], parts[3]).await {
                    Ok(val) => ok_json(&val),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "SET" => {
                if parts.len() < 5 {
                    continue;
                }
                // The value is everything after the key, rejoined with
                // single spaces. Clients must send compact JSON.
                let val_str = parts[4..].join(" ");
                match serde_json::from_str(&val_str) {
                    Ok(val) => match store.set(parts[1], parts[2], parts[3], val).await {
                        Ok(()) => "OK".to_string(),
                        Err(e) => format!("ERR {e}"),
                    },
                    Err(_) => "ERR invalid json value".to_string(),
                }
            }
            "DEL" => {
                if parts.len() < 4 {
                    continue;
                }
                match store.delete(parts[1], parts[2], parts[3]).await {
                    Ok(()) => "OK".to_string(),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "LIST_PERSONAS" => match store.get_personas().await {
                Ok(list) => ok_json(&list),
                Err(e) => format!("ERR {e}"),
            },
            "LIST_APPS" => {
                if parts.len() < 2 {
                    continue;
                }
                match store.get_apps(parts[1]).await {
                    Ok(list) => ok_json(&list),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "DUMP" => {
                if parts.len() < 3 {
                    continue;
                }
                match store.get_app_store(parts[1], parts[2]).await {
                    Ok(data) => ok_json(&data),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "DUMP_APP" => {
                if parts.len() < 2 {
                    continue;
                }
                match store.dump_app(parts[1]).await {
                    Ok(data) => ok_json(&data),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "GET_GLOBAL" => {
                if parts.len() < 3 {
                    continue;
                }
                match store.get_global(parts[1], parts[2]).await {
                    Ok((val, persona)) => ok_json(&serde_json::json!({
                        "persona": persona,
                        "value": val,
                    })),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "MOVE" => {
                if parts.len() < 5 {
                    continue;
                }
                match store
                    .move_key(parts[1], parts[2], parts[3], parts[4])
                    .await
                {
                    Ok(()) => "OK".to_string(),
                    Err(e) => format!("ERR {e}"),
                }
            }
            "PING" => "PONG".to_string(),
            "QUIT" => break,
            // Unknown commands get no reply, for forward compatibility.
            _ => continue,
        };

        writer.write_all(format!("{response}\n").as_bytes()).await?;
    }

    Ok(())
}

fn ok_json<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(s) => format!("OK {s}"),
        Err(_) => "ERR internal error".to_string(),
    }
}
