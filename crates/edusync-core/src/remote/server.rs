//! Reference remote store server
//!
//! Serves a [`MemoryRemote`] to [`WsRemote`](super::WsRemote) clients over
//! WebSocket. Every connection gets its own task; change feeds are forwarded
//! through the connection's outbound queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::message::{decode_document, encode_document, ClientMessage, ServerMessage};
use super::{parse_path, MemoryRemote, RemoteChange};
use crate::subscription::Subscription;

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, store: MemoryRemote) -> std::io::Result<()> {
    let server_id: Arc<str> =
        format!("edusync-server-{}", &uuid::Uuid::new_v4().to_string()[..8]).into();
    info!(addr = %listener.local_addr()?, server = %server_id, "Remote store listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let store = store.clone();
        let server_id = server_id.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, store, server_id).await;
        });
    }
}

/// Bind `addr` and serve in the background, returning the bound address
pub async fn spawn(
    addr: &str,
    store: MemoryRemote,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((local, tokio::spawn(serve(listener, store))))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: MemoryRemote,
    server_id: Arc<str>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "WebSocket handshake failed: {}", e);
            return;
        }
    };
    debug!(%peer, "Client connected");

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode response: {}", e);
                    continue;
                }
            };
            if write.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut session = Session {
        store,
        server_id,
        outbound: tx,
        feeds: HashMap::new(),
    };

    while let Some(frame) = read.next().await {
        let data = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%peer, "Connection error: {}", e);
                break;
            }
        };

        let reply = match ClientMessage::decode(&data) {
            Ok(message) => session.handle(message),
            Err(e) => ServerMessage::error(None, e.to_string()),
        };
        if session.outbound.send(reply).is_err() {
            break;
        }
    }

    // Releases the change feeds and closes the outbound queue
    drop(session);
    let _ = writer.await;
    debug!(%peer, "Client disconnected");
}

/// Per-connection state
struct Session {
    store: MemoryRemote,
    server_id: Arc<str>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    feeds: HashMap<String, Subscription>,
}

impl Session {
    fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        match message {
            ClientMessage::Hello { client_id, .. } => {
                debug!(client = %client_id, "Client hello");
                ServerMessage::welcome(&self.server_id)
            }

            ClientMessage::Set {
                request_id,
                path,
                body,
            } => {
                let Some((collection, id)) = parse_path(&path) else {
                    return ServerMessage::error(Some(request_id), format!("Invalid path '{}'", path));
                };
                let doc = match decode_document(&body) {
                    Ok(doc) => doc,
                    Err(e) => return ServerMessage::error(Some(request_id), e.to_string()),
                };
                if doc.id != id {
                    return ServerMessage::error(
                        Some(request_id),
                        format!("Document id '{}' does not match path '{}'", doc.id, path),
                    );
                }
                self.store.put_document(collection, doc);
                ServerMessage::Ack { request_id }
            }

            ClientMessage::Remove { request_id, path } => {
                let Some((collection, id)) = parse_path(&path) else {
                    return ServerMessage::error(Some(request_id), format!("Invalid path '{}'", path));
                };
                self.store.remove_document(collection, id);
                ServerMessage::Ack { request_id }
            }

            ClientMessage::List {
                request_id,
                collection,
            } => {
                let documents: Result<Vec<_>, _> = self
                    .store
                    .documents(&collection)
                    .iter()
                    .map(encode_document)
                    .collect();
                match documents {
                    Ok(documents) => ServerMessage::Documents {
                        request_id,
                        documents,
                    },
                    Err(e) => ServerMessage::error(Some(request_id), e.to_string()),
                }
            }

            ClientMessage::Subscribe {
                request_id,
                collection,
            } => {
                if !self.feeds.contains_key(&collection) {
                    let outbound = self.outbound.clone();
                    let feed = self.store.add_handler(
                        &collection,
                        Arc::new(move |change: RemoteChange| {
                            let body = match change.document.as_ref().map(encode_document).transpose()
                            {
                                Ok(body) => body,
                                Err(e) => {
                                    warn!("Failed to encode change: {}", e);
                                    return;
                                }
                            };
                            let _ = outbound.send(ServerMessage::Change {
                                collection: change.collection,
                                id: change.id,
                                body,
                            });
                        }),
                    );
                    self.feeds.insert(collection, feed);
                }
                ServerMessage::Ack { request_id }
            }

            ClientMessage::Unsubscribe {
                request_id,
                collection,
            } => {
                self.feeds.remove(&collection);
                ServerMessage::Ack { request_id }
            }

            ClientMessage::Ping { request_id } => ServerMessage::Pong { request_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::remote::{to_remote, RemoteAdapter, RemoteDocument, RemoteError, WsRemote};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn doc(id: &str, name: &str) -> RemoteDocument {
        let serde_json::Value::Object(data) = json!({ "name": name }) else {
            unreachable!()
        };
        to_remote(&Record::new(id, data, Utc::now()))
    }

    async fn start() -> (MemoryRemote, String) {
        let store = MemoryRemote::new();
        let (addr, _handle) = spawn("127.0.0.1:0", store.clone()).await.unwrap();
        (store, format!("ws://{}", addr))
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let (store, url) = start().await;
        let client = WsRemote::connect(&url, Duration::from_secs(5)).await.unwrap();
        assert!(client.is_connected());

        client.ping().await.unwrap();
        client.set("students", doc("s1", "Ada")).await.unwrap();
        assert_eq!(store.document("students", "s1").unwrap().fields["name"], json!("Ada"));

        let all = client.fetch_all("students").await.unwrap();
        assert_eq!(all, vec![doc_with_name(&store, "s1")]);

        client.remove("students", "s1").await.unwrap();
        assert!(store.document("students", "s1").is_none());
        // Removing a missing document succeeds
        client.remove("students", "s1").await.unwrap();
    }

    fn doc_with_name(store: &MemoryRemote, id: &str) -> RemoteDocument {
        store.document("students", id).unwrap()
    }

    #[tokio::test]
    async fn test_change_feed_between_clients() {
        let (_store, url) = start().await;
        let watcher = WsRemote::connect(&url, Duration::from_secs(5)).await.unwrap();
        let writer = WsRemote::connect(&url, Duration::from_secs(5)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = watcher
            .subscribe(
                "students",
                Arc::new(move |change: RemoteChange| {
                    let _ = tx.send(change);
                }),
            )
            .await
            .unwrap();

        writer.set("students", doc("s1", "Ada")).await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.id, "s1");
        assert_eq!(change.document.unwrap().fields["name"], json!("Ada"));

        writer.remove("students", "s1").await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(change.document.is_none());

        drop(sub);
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions() {
        let (store, url) = start().await;
        let client = WsRemote::connect(&url, Duration::from_secs(5)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = client
            .subscribe(
                "teachers",
                Arc::new(move |change: RemoteChange| {
                    let _ = tx.send(change.id);
                }),
            )
            .await
            .unwrap();

        client.close();
        assert!(!client.is_connected());
        client.ping().await.unwrap();

        // Wait for the replayed subscription to land before writing
        for _ in 0..50 {
            if store.subscriber_count("teachers") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        store.put_document("teachers", doc("t1", "Grace"));

        let id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "t1");
    }

    #[tokio::test]
    async fn test_server_stopped_is_unavailable() {
        let store = MemoryRemote::new();
        let (addr, handle) = spawn("127.0.0.1:0", store).await.unwrap();
        handle.abort();
        let _ = handle.await;

        let client = WsRemote::new(&format!("ws://{}", addr), Duration::from_secs(2));
        assert_eq!(client.ping().await, Err(RemoteError::Unavailable));
    }
}
