use std::net::SocketAddr;
use std::sync::Arc;

use celerix_store::engine::{vault, MemStore};
use celerix_store::sdk::Client;
use celerix_store::server::{router, Router};
use celerix_store::{
    AppEnumeration, BatchExporter, CelerixStore, Error, GlobalSearcher, KVReader, KVWriter,
    Orchestrator, StoreData,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Serves `handle_connection` on an ephemeral port, plain TCP.
async fn spawn_server(store: Arc<MemStore>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let s = store.clone();
            tokio::spawn(async move {
                let _ = router::handle_connection(socket, s).await;
            });
        }
    });

    addr
}

/// A raw line-protocol connection for driving the daemon without the client.
struct RawConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawConn {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        let mut reply = String::new();
        self.reader.read_line(&mut reply).await.unwrap();
        reply.trim_end().to_string()
    }

    /// Writes a line without waiting for any reply.
    async fn send_silent(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }
}

fn ram_store() -> Arc<MemStore> {
    Arc::new(MemStore::new(StoreData::new(), None))
}

#[tokio::test]
async fn test_ping_pong() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;
    assert_eq!(conn.send("PING").await, "PONG");
}

#[tokio::test]
async fn test_set_get_del_over_wire() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;

    assert_eq!(conn.send(r#"SET p1 a1 k1 {"name":"test"}"#).await, "OK");
    assert_eq!(conn.send("GET p1 a1 k1").await, r#"OK {"name":"test"}"#);

    assert_eq!(conn.send("DEL p1 a1 k1").await, "OK");
    assert_eq!(conn.send("GET p1 a1 k1").await, "ERR key not found");
}

#[tokio::test]
async fn test_move_over_wire() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;

    assert_eq!(conn.send(r#"SET p1 a1 k1 "v1""#).await, "OK");
    assert_eq!(conn.send("MOVE p1 p2 a1 k1").await, "OK");
    assert_eq!(conn.send("GET p2 a1 k1").await, r#"OK "v1""#);
    assert_eq!(conn.send("GET p1 a1 k1").await, "ERR key not found");
}

#[tokio::test]
async fn test_invalid_json_value() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;

    assert_eq!(
        conn.send("SET p1 a1 k1 not-valid-json").await,
        "ERR invalid json value"
    );
}

#[tokio::test]
async fn test_unknown_and_truncated_commands_get_no_reply() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;

    conn.send_silent("FROBNICATE p1 a1").await;
    conn.send_silent("GET p1 a1").await; // one token short
    conn.send_silent("").await;

    // The next reply on the wire must belong to this PING, proving the
    // lines above produced none.
    assert_eq!(conn.send("PING").await, "PONG");
}

#[tokio::test]
async fn test_multi_space_runs_are_normalized() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;

    // The parser splits on whitespace and rejoins with single spaces, so
    // extra spaces inside a string literal collapse. Documented behavior.
    assert_eq!(conn.send(r#"SET p1 a1 k1 "x  y""#).await, "OK");
    assert_eq!(conn.send("GET p1 a1 k1").await, r#"OK "x y""#);
}

#[tokio::test]
async fn test_enumeration_and_dump_over_wire() {
    let store = ram_store();
    store.set("p1", "a1", "k1", json!(1)).await.unwrap();
    store.set("p1", "a2", "k2", json!(2)).await.unwrap();
    store.set("p2", "a1", "k3", json!(3)).await.unwrap();

    let addr = spawn_server(store).await;
    let mut conn = RawConn::open(addr).await;

    let reply = conn.send("LIST_PERSONAS").await;
    let mut personas: Vec<String> =
        serde_json::from_str(reply.strip_prefix("OK ").unwrap()).unwrap();
    personas.sort();
    assert_eq!(personas, vec!["p1", "p2"]);

    let reply = conn.send("LIST_APPS p1").await;
    let mut apps: Vec<String> = serde_json::from_str(reply.strip_prefix("OK ").unwrap()).unwrap();
    apps.sort();
    assert_eq!(apps, vec!["a1", "a2"]);

    assert_eq!(conn.send("DUMP p1 a1").await, r#"OK {"k1":1}"#);
    assert_eq!(conn.send("DUMP p9 a1").await, "ERR app not found");

    let reply = conn.send("DUMP_APP a1").await;
    let dump: serde_json::Value =
        serde_json::from_str(reply.strip_prefix("OK ").unwrap()).unwrap();
    assert_eq!(dump["p1"]["k1"], json!(1));
    assert_eq!(dump["p2"]["k3"], json!(3));

    assert_eq!(
        conn.send("GET_GLOBAL a1 k3").await,
        r#"OK {"persona":"p2","value":3}"#
    );
    assert_eq!(conn.send("GET_GLOBAL a1 nope").await, "ERR key not found");
}

#[tokio::test]
async fn test_quit_closes_connection() {
    let addr = spawn_server(ram_store()).await;
    let mut conn = RawConn::open(addr).await;

    conn.send_silent("QUIT").await;
    let mut buf = String::new();
    let n = conn.reader.read_line(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_client_protocol_parity() {
    let store = ram_store();
    let addr = spawn_server(store.clone()).await;
    let client = Client::connect_with(&addr.to_string(), false).await.unwrap();

    client.ping().await.unwrap();

    client.set("p1", "a1", "k1", json!("v1")).await.unwrap();
    assert_eq!(client.get("p1", "a1", "k1").await.unwrap(), json!("v1"));
    // The write really landed in the shared engine.
    assert_eq!(store.get("p1", "a1", "k1").await.unwrap(), json!("v1"));

    // Engine errors surface as the same typed variants as embedded calls.
    assert!(matches!(
        client.get("p1", "a1", "ghost").await,
        Err(Error::KeyNotFound)
    ));
    assert!(matches!(
        client.get("ghost", "a1", "k1").await,
        Err(Error::PersonaNotFound)
    ));
    assert!(matches!(
        client.get("p1", "ghost", "k1").await,
        Err(Error::AppNotFound)
    ));

    client.set("p1", "a1", "k2", json!({"n": 2})).await.unwrap();
    let dump = client.get_app_store("p1", "a1").await.unwrap();
    assert_eq!(dump.len(), 2);
    assert_eq!(dump["k2"], json!({"n": 2}));

    let personas = client.get_personas().await.unwrap();
    assert_eq!(personas, vec!["p1"]);
    assert_eq!(client.get_apps("p1").await.unwrap(), vec!["a1"]);

    let (val, persona) = client.get_global("a1", "k1").await.unwrap();
    assert_eq!((val, persona.as_str()), (json!("v1"), "p1"));

    client.move_key("p1", "p2", "a1", "k1").await.unwrap();
    assert_eq!(client.get("p2", "a1", "k1").await.unwrap(), json!("v1"));
    assert!(matches!(
        client.get("p1", "a1", "k1").await,
        Err(Error::KeyNotFound)
    ));

    let all = client.dump_app("a1").await.unwrap();
    assert_eq!(all["p2"]["k1"], json!("v1"));

    client.delete("p2", "a1", "k1").await.unwrap();
    assert!(client.get("p2", "a1", "k1").await.is_err());

    client.close().await;
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct User {
    name: String,
    age: i32,
}

#[tokio::test]
async fn test_generic_helpers_over_wire() {
    let addr = spawn_server(ram_store()).await;
    let client = Client::connect_with(&addr.to_string(), false).await.unwrap();

    let user = User {
        name: "Alice".to_string(),
        age: 30,
    };
    client.set_generic("p1", "a1", "user1", &user).await.unwrap();

    let got: User = client.get_generic("p1", "a1", "user1").await.unwrap();
    assert_eq!(got, user);
}

#[tokio::test]
async fn test_client_scopes_and_vault() {
    let store = ram_store();
    let addr = spawn_server(store.clone()).await;
    let client = Client::connect_with(&addr.to_string(), false).await.unwrap();

    let master_key = b"thisis32byteslongsecretkey123456";
    let scope = client.app("p1", "a1");
    scope.set("plain", json!("visible")).await.unwrap();
    assert_eq!(scope.get("plain").await.unwrap(), json!("visible"));

    let v = scope.vault(master_key);
    v.set("password", "topsecret").await.unwrap();
    assert_eq!(v.get("password").await.unwrap(), "topsecret");

    // The daemon stores ciphertext only; encryption happened client-side.
    let raw = store.get("p1", "a1", "password").await.unwrap();
    let cipher_hex = raw.as_str().unwrap();
    assert_ne!(cipher_hex, "topsecret");
    assert_eq!(
        vault::decrypt(cipher_hex, master_key).unwrap(),
        "topsecret"
    );
}

#[tokio::test]
async fn test_client_reconnects_after_connection_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A server that answers exactly one command per connection and hangs up.
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (reader, mut writer) = socket.split();
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) > 0 {
                    writer.write_all(b"OK \"hello\"\n").await.ok();
                }
            });
        }
    });

    let client = Client::connect_with(&addr.to_string(), false).await.unwrap();
    assert_eq!(client.get("p", "a", "k").await.unwrap(), json!("hello"));
    // The previous connection is gone; this one forces a redial.
    assert_eq!(client.get("p", "a", "k").await.unwrap(), json!("hello"));
}

#[tokio::test]
async fn test_tls_end_to_end() {
    let store = ram_store();
    let mut router = Router::new(store.clone());
    let (cert, key) = vault::generate_self_signed_cert().unwrap();
    router.set_certificate(cert, key).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = router.serve(listener).await;
    });

    let client = Client::connect_with(&addr.to_string(), true).await.unwrap();
    client.ping().await.unwrap();
    client.set("p1", "a1", "k1", json!("secret")).await.unwrap();
    assert_eq!(client.get("p1", "a1", "k1").await.unwrap(), json!("secret"));
    assert_eq!(store.get("p1", "a1", "k1").await.unwrap(), json!("secret"));
    client.close().await;
}

#[tokio::test]
async fn test_router_serves_plain_tcp() {
    let store = ram_store();
    let router = Router::new(store);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = router.serve(listener).await;
    });

    let mut conn = RawConn::open(addr).await;
    assert_eq!(conn.send("PING").await, "PONG");
    assert_eq!(conn.send(r#"SET p1 a1 k1 42"#).await, "OK");
    assert_eq!(conn.send("GET p1 a1 k1").await, "OK 42");
}

#[tokio::test]
async fn test_discovery_modes() {
    use std::env;

    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();

    // Unreachable remote: fall back to the embedded engine.
    env::set_var("CELERIX_STORE_ADDR", "127.0.0.1:1");
    env::set_var("CELERIX_DISABLE_TLS", "true");
    let store = celerix_store::sdk::new(&data_dir).await.unwrap();
    store.set("p1", "a1", "k1", json!("local")).await.unwrap();
    assert_eq!(store.get("p1", "a1", "k1").await.unwrap(), json!("local"));

    // Reachable remote: discovery returns a connected client.
    let remote_engine = ram_store();
    remote_engine
        .set("p9", "a9", "k9", json!("remote"))
        .await
        .unwrap();
    let addr = spawn_server(remote_engine).await;
    env::set_var("CELERIX_STORE_ADDR", addr.to_string());
    let store = celerix_store::sdk::new(&data_dir).await.unwrap();
    assert_eq!(store.get("p9", "a9", "k9").await.unwrap(), json!("remote"));

    env::remove_var("CELERIX_STORE_ADDR");
    env::remove_var("CELERIX_DISABLE_TLS");
}

#[tokio::test]
async fn test_migrate_embedded_to_remote() {
    let src = ram_store();
    src.set("p1", "a1", "k1", json!("v1")).await.unwrap();
    src.set("p2", "a1", "k2", json!([1, 2])).await.unwrap();

    let remote_engine = ram_store();
    let addr = spawn_server(remote_engine.clone()).await;
    let client = Client::connect_with(&addr.to_string(), false).await.unwrap();

    celerix_store::engine::migrate(src.as_ref(), &client)
        .await
        .unwrap();

    assert_eq!(
        remote_engine.get("p1", "a1", "k1").await.unwrap(),
        json!("v1")
    );
    assert_eq!(
        remote_engine.get("p2", "a1", "k2").await.unwrap(),
        json!([1, 2])
    );
}
