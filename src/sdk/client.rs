use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_rustls::TlsConnector;

use crate::engine::vault;
use crate::{
    AppData, AppEnumeration, AppScope, BatchExporter, CelerixStore, Error, GlobalSearcher,
    KVReader, KVWriter, Orchestrator, Result, VaultScope,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Combined write+read deadline for one request/response exchange.
const OP_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

struct ClientInner {
    reader: BufReader<ReadHalf<Box<dyn Stream>>>,
    writer: WriteHalf<Box<dyn Stream>>,
}

/// Remote client for a Celerix Store daemon.
///
/// Holds a single connection; a mutex serializes request/response pairs, so
/// a `Client` can be shared across tasks (operations are safe, not
/// parallel). Transport failures are retried with reconnects; `ERR` replies
/// from the daemon are surfaced immediately and never retried.
pub struct Client {
    addr: String,
    tls: Option<TlsConnector>,
    inner: Mutex<Option<ClientInner>>,
}

impl Client {
    /// Connects to a remote daemon. TLS is on unless `CELERIX_DISABLE_TLS`
    /// is set to `true`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let use_tls = env::var("CELERIX_DISABLE_TLS").unwrap_or_default() != "true";
        Self::connect_with(addr, use_tls).await
    }

    /// Connects with an explicit transport choice.
    pub async fn connect_with(addr: &str, use_tls: bool) -> Result<Self> {
        let client = Self {
            addr: addr.to_string(),
            tls: use_tls.then(|| TlsConnector::from(Arc::new(danger::insecure_tls_config()))),
            inner: Mutex::new(None),
        };
        let inner = client.connect_inner().await?;
        *client.inner.lock().await = Some(inner);
        Ok(client)
    }

    async fn connect_inner(&self) -> Result<ClientInner> {
        let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| Error::Internal(format!("dial timeout connecting to {}", self.addr)))??;

        let boxed: Box<dyn Stream> = match &self.tls {
            Some(connector) => {
                let sock = socket2::SockRef::from(&stream);
                let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE);
                if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                    warn!("could not enable tcp keep-alive: {e}");
                }

                let host = self
                    .addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(&self.addr);
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
                Box::new(connector.connect(server_name, stream).await?)
            }
            None => Box::new(stream),
        };

        let (reader, writer) = tokio::io::split(boxed);
        Ok(ClientInner {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one command line and reads one reply line, redialing on
    /// transport failures.
    async fn send_and_receive(&self, cmd: &str) -> Result<String> {
        let mut guard = self.inner.lock().await;
        let mut last_err = String::new();

        for i in 0..MAX_ATTEMPTS {
            if guard.is_none() {
                match self.connect_inner().await {
                    Ok(inner) => *guard = Some(inner),
                    Err(e) => {
                        last_err = format!("reconnect failed: {e}");
                        warn!("attempt {}: {last_err}", i + 1);
                        time::sleep(Duration::from_millis(u64::from(i) * 100)).await;
                        continue;
                    }
                }
            }

            let inner = guard.as_mut().unwrap();
            match time::timeout(OP_TIMEOUT, roundtrip(inner, cmd)).await {
                Ok(Ok(reply)) => {
                    let reply = reply.trim_end();
                    if let Some(msg) = reply.strip_prefix("ERR ") {
                        return Err(Error::from_wire(msg));
                    }
                    return Ok(reply.to_string());
                }
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "operation deadline exceeded".to_string(),
            }

            // The connection is suspect; drop it and redial next attempt.
            *guard = None;
            warn!("attempt {} failed: {last_err}; reconnecting", i + 1);
            time::sleep(Duration::from_millis(u64::from(i + 1) * 200)).await;
        }

        Err(Error::AttemptsExhausted {
            attempts: MAX_ATTEMPTS,
            last: last_err,
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let reply = self.send_and_receive("PING").await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(Error::Internal(format!("unexpected ping reply: {reply}")))
        }
    }

    /// Sends a best-effort `QUIT` and drops the connection.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_mut() {
            let _ = inner.writer.write_all(b"QUIT\n").await;
            let _ = inner.writer.shutdown().await;
        }
        *guard = None;
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

async fn roundtrip(inner: &mut ClientInner, cmd: &str) -> std::io::Result<String> {
    inner.writer.write_all(format!("{cmd}\n").as_bytes()).await?;
    let mut reply = String::new();
    let n = inner.reader.read_line(&mut reply).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        ));
    }
    Ok(reply)
}

fn parse_ok_json<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let json_data = reply
        .strip_prefix("OK ")
        .ok_or_else(|| Error::Internal(format!("malformed reply: {reply}")))?;
    Ok(serde_json::from_str(json_data)?)
}

#[async_trait]
impl KVReader for Client {
    async fn get(&self, persona_id: &str, app_id: &str, key: &str) -> Result<serde_json::Value> {
        let reply = self
            .send_and_receive(&format!("GET {persona_id} {app_id} {key}"))
            .await?;
        parse_ok_json(&reply)
    }
}

#[async_trait]
impl KVWriter for Client {
    async fn set(
        &self,
        persona_id: &str,
        app_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        // Compact encoding: the daemon rejoins value tokens with single
        // spaces, so the literal must not rely on its own whitespace.
        let val_str = serde_json::to_string(&value)?;
        self.send_and_receive(&format!("SET {persona_id} {app_id} {key} {val_str}"))
            .await?;
        Ok(())
    }

    async fn delete(&self, persona_id: &str, app_id: &str, key: &str) -> Result<()> {
        self.send_and_receive(&format!("DEL {persona_id} {app_id} {key}"))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AppEnumeration for Client {
    async fn get_personas(&self) -> Result<Vec<String>> {
        let reply = self.send_and_receive("LIST_PERSONAS").await?;
        parse_ok_json(&reply)
    }

    async fn get_apps(&self, persona_id: &str) -> Result<Vec<String>> {
        let reply = self
            .send_and_receive(&format!("LIST_APPS {persona_id}"))
            .await?;
        parse_ok_json(&reply)
    }
}

#[async_trait]
impl BatchExporter for Client {
    async fn get_app_store(&self, persona_id: &str, app_id: &str) -> Result<AppData> {
        let reply = self
            .send_and_receive(&format!("DUMP {persona_id} {app_id}"))
            .await?;
        parse_ok_json(&reply)
    }

    async fn dump_app(&self, app_id: &str) -> Result<HashMap<String, AppData>> {
        let reply = self.send_and_receive(&format!("DUMP_APP {app_id}")).await?;
        parse_ok_json(&reply)
    }
}

#[async_trait]
impl GlobalSearcher for Client {
    async fn get_global(&self, app_id: &str, key: &str) -> Result<(serde_json::Value, String)> {
        #[derive(serde::Deserialize)]
        struct GlobalReply {
            persona: String,
            value: serde_json::Value,
        }

        let reply = self
            .send_and_receive(&format!("GET_GLOBAL {app_id} {key}"))
            .await?;
        let out: GlobalReply = parse_ok_json(&reply)?;
        Ok((out.value, out.persona))
    }
}

#[async_trait]
impl Orchestrator for Client {
    async fn move_key(
        &self,
        src_persona: &str,
        dst_persona: &str,
        app_id: &str,
        key: &str,
    ) -> Result<()> {
        self.send_and_receive(&format!("MOVE {src_persona} {dst_persona} {app_id} {key}"))
            .await?;
        Ok(())
    }
}

impl CelerixStore for Client {
    fn app(&self, persona_id: &str, app_id: &str) -> Box<dyn AppScope + '_> {
        Box::new(RemoteAppScope {
            client: self,
            persona_id: persona_id.to_string(),
            app_id: app_id.to_string(),
        })
    }
}

pub struct RemoteAppScope<'a> {
    client: &'a Client,
    persona_id: String,
    app_id: String,
}

#[async_trait]
impl<'a> AppScope for RemoteAppScope<'a> {
    async fn get(&self, key: &str) -> Result<serde_json::Value> {
        self.client.get(&self.persona_id, &self.app_id, key).await
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.client
            .set(&self.persona_id, &self.app_id, key, value)
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete(&self.persona_id, &self.app_id, key)
            .await
    }

    fn vault(&self, master_key: &[u8]) -> Box<dyn VaultScope + '_> {
        Box::new(RemoteVaultScope {
            app: self,
            master_key: master_key.to_vec(),
        })
    }
}

pub struct RemoteVaultScope<'a> {
    app: &'a RemoteAppScope<'a>,
    master_key: Vec<u8>,
}

#[async_trait]
impl<'a> VaultScope for RemoteVaultScope<'a> {
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

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{
        ring::default_provider, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

    /// Accepts any server certificate.
    ///
    /// The daemon mints a fresh self-signed certificate every startup, so
    /// there is nothing meaningful to verify; TLS here provides
    /// confidentiality on the wire, not authentication.
    #[derive(Debug)]
    struct NoCertificateVerification(CryptoProvider);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    pub(super) fn insecure_tls_config() -> ClientConfig {
        let mut cfg = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        cfg.dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification(default_provider())));
        cfg
    }
}
