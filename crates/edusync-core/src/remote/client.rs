//! WebSocket remote client
//!
//! Talks to [`serve`](super::server::serve) over a single multiplexed
//! connection. The connection is opened lazily and re-opened on the next
//! request after it drops; change-feed subscriptions are replayed on every
//! reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, trace, warn};

use super::message::{decode_document, encode_document, ClientMessage, RequestId, ServerMessage};
use super::{
    remote_path, ChangeHandler, RemoteAdapter, RemoteChange, RemoteDocument, RemoteError,
    RemoteResult,
};
use crate::subscription::Subscription;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;
type HandlerMap = HashMap<String, Vec<(u64, ChangeHandler)>>;

/// Remote store reached over WebSocket
#[derive(Clone)]
pub struct WsRemote {
    url: String,
    client_id: String,
    timeout: Duration,
    shared: Arc<Shared>,
}

struct Shared {
    connection: Mutex<Option<Connection>>,
    /// Serializes connection attempts
    connect_gate: tokio::sync::Mutex<()>,
    handlers: Mutex<HandlerMap>,
    next_request: AtomicU64,
    next_handler: AtomicU64,
}

/// Handle on a live connection's outbound queue and in-flight requests
#[derive(Clone)]
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }
}

struct Connection {
    link: Link,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl WsRemote {
    /// Create a client; no connection is made until the first request
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client_id = format!("edusync-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        Self {
            url: url.to_string(),
            client_id,
            timeout,
            shared: Arc::new(Shared {
                connection: Mutex::new(None),
                connect_gate: tokio::sync::Mutex::new(()),
                handlers: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
                next_handler: AtomicU64::new(1),
            }),
        }
    }

    /// Create a client and open its connection immediately
    pub async fn connect(url: &str, timeout: Duration) -> RemoteResult<Self> {
        let remote = Self::new(url, timeout);
        remote.ensure_connected().await?;
        Ok(remote)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.live_link().is_some()
    }

    /// Drop the current connection; the next request reconnects
    pub fn close(&self) {
        if self.shared.connection().take().is_some() {
            debug!(url = %self.url, "Closed remote connection");
        }
    }

    async fn ensure_connected(&self) -> RemoteResult<Link> {
        if let Some(link) = self.shared.live_link() {
            return Ok(link);
        }

        let _gate = self.shared.connect_gate.lock().await;
        if let Some(link) = self.shared.live_link() {
            return Ok(link);
        }

        let connection = self.open().await?;
        let link = connection.link.clone();
        *self.shared.connection() = Some(connection);

        // Replay feeds registered before this connection existed
        for collection in self.shared.subscribed_collections() {
            let request_id = self.shared.next_request_id();
            send(
                &link,
                &ClientMessage::Subscribe {
                    request_id,
                    collection,
                },
            )?;
        }

        Ok(link)
    }

    async fn open(&self) -> RemoteResult<Connection> {
        debug!(url = %self.url, "Connecting to remote store");

        let mut ws = match tokio::time::timeout(self.timeout, connect_async(self.url.as_str())).await
        {
            Err(_) => return Err(RemoteError::Timeout(self.timeout)),
            Ok(Err(tungstenite::Error::Io(e))) => {
                debug!(url = %self.url, "Remote store unreachable: {}", e);
                return Err(RemoteError::Unavailable);
            }
            Ok(Err(e)) => return Err(transport(e)),
            Ok(Ok((ws, _response))) => ws,
        };

        let hello = ClientMessage::hello(&self.client_id).encode()?;
        ws.send(Message::Binary(hello)).await.map_err(transport)?;

        let handshake = async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data)? {
                        ServerMessage::Welcome { server_id, .. } => return Ok(server_id),
                        ServerMessage::Error { message, .. } => {
                            return Err(RemoteError::Rejected(message))
                        }
                        _ => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(RemoteError::Transport(
                            "Connection closed during handshake".to_string(),
                        ))
                    }
                    Some(Err(e)) => return Err(transport(e)),
                    Some(Ok(_)) => {}
                }
            }
        };
        let server_id = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| RemoteError::Timeout(self.timeout))??;

        info!(url = %self.url, server = %server_id, "Connected to remote store");

        let (mut write, mut read) = ws.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn({
            let closed = closed.clone();
            async move {
                while let Some(frame) = queue.recv().await {
                    if let Err(e) = write.send(frame).await {
                        debug!("Remote write failed: {}", e);
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
                let _ = write.close().await;
            }
        });

        let reader = tokio::spawn({
            let closed = closed.clone();
            let pending = pending.clone();
            let shared = Arc::downgrade(&self.shared);
            async move {
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                            Ok(message) => dispatch(&shared, &pending, message),
                            Err(e) => warn!("Ignoring undecodable frame: {}", e),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("Remote connection error: {}", e);
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders fails every in-flight request
                lock(&pending).clear();
                debug!("Remote connection closed");
            }
        });

        Ok(Connection {
            link: Link {
                outbound,
                pending,
                closed,
            },
            reader,
            writer,
        })
    }

    /// Send a request and wait for its response
    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> RemoteResult<ServerMessage> {
        let link = self.ensure_connected().await?;
        let request_id = self.shared.next_request_id();
        let message = build(request_id);

        let (tx, rx) = oneshot::channel();
        lock(&link.pending).insert(request_id, tx);

        if let Err(e) = send(&link, &message) {
            lock(&link.pending).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(ServerMessage::Error { message, .. })) => Err(RemoteError::Rejected(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RemoteError::Transport(
                "Connection closed before response".to_string(),
            )),
            Err(_) => {
                lock(&link.pending).remove(&request_id);
                Err(RemoteError::Timeout(self.timeout))
            }
        }
    }
}

impl Shared {
    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        lock(&self.connection)
    }

    fn handlers(&self) -> MutexGuard<'_, HandlerMap> {
        lock(&self.handlers)
    }

    fn live_link(&self) -> Option<Link> {
        self.connection()
            .as_ref()
            .map(|c| c.link.clone())
            .filter(|link| !link.is_closed())
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::SeqCst)
    }

    fn subscribed_collections(&self) -> Vec<String> {
        self.handlers().keys().cloned().collect()
    }

    /// Add a handler; true if it is the first one for the collection
    fn add_handler(&self, collection: &str, handler_id: u64, handler: ChangeHandler) -> bool {
        let mut handlers = self.handlers();
        let list = handlers.entry(collection.to_string()).or_default();
        list.push((handler_id, handler));
        list.len() == 1
    }

    /// Remove a handler; true if it was the last one for the collection
    fn remove_handler(&self, collection: &str, handler_id: u64) -> bool {
        let mut handlers = self.handlers();
        let Some(list) = handlers.get_mut(collection) else {
            return false;
        };
        list.retain(|(id, _)| *id != handler_id);
        if list.is_empty() {
            handlers.remove(collection);
            true
        } else {
            false
        }
    }

    fn notify(&self, change: RemoteChange) {
        let handlers: Vec<ChangeHandler> = self
            .handlers()
            .get(&change.collection)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(change.clone());
        }
    }
}

fn dispatch(shared: &Weak<Shared>, pending: &PendingMap, message: ServerMessage) {
    let request_id = match &message {
        ServerMessage::Ack { request_id }
        | ServerMessage::Pong { request_id }
        | ServerMessage::Documents { request_id, .. } => Some(*request_id),
        ServerMessage::Error { request_id, message } => {
            if request_id.is_none() {
                warn!("Remote store error: {}", message);
            }
            *request_id
        }
        ServerMessage::Change {
            collection,
            id,
            body,
        } => {
            let document = match body.as_deref().map(|b| decode_document(b)).transpose() {
                Ok(document) => document,
                Err(e) => {
                    warn!(collection = %collection, id = %id, "Dropping change: {}", e);
                    return;
                }
            };
            trace!(collection = %collection, id = %id, "Remote change received");
            if let Some(shared) = shared.upgrade() {
                shared.notify(RemoteChange {
                    collection: collection.clone(),
                    id: id.clone(),
                    document,
                });
            }
            None
        }
        ServerMessage::Welcome { .. } => None,
    };

    if let Some(request_id) = request_id {
        let waiter = lock(pending).remove(&request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => trace!(request_id, "Response for unknown request"),
        }
    }
}

fn send(link: &Link, message: &ClientMessage) -> RemoteResult<()> {
    let bytes = message.encode()?;
    link.outbound
        .send(Message::Binary(bytes))
        .map_err(|_| RemoteError::Transport("Connection closed".to_string()))
}

fn transport(e: tungstenite::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unexpected(message: ServerMessage) -> RemoteError {
    RemoteError::Protocol(format!("Unexpected response: {:?}", message))
}

#[async_trait]
impl RemoteAdapter for WsRemote {
    async fn set(&self, collection: &str, doc: RemoteDocument) -> RemoteResult<()> {
        let path = remote_path(collection, &doc.id);
        let body = encode_document(&doc)?;
        match self
            .request(|request_id| ClientMessage::Set {
                request_id,
                path,
                body,
            })
            .await?
        {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn remove(&self, collection: &str, id: &str) -> RemoteResult<()> {
        let path = remote_path(collection, id);
        match self
            .request(|request_id| ClientMessage::Remove { request_id, path })
            .await?
        {
            ServerMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn fetch_all(&self, collection: &str) -> RemoteResult<Vec<RemoteDocument>> {
        let collection = collection.to_string();
        match self
            .request(|request_id| ClientMessage::List {
                request_id,
                collection,
            })
            .await?
        {
            ServerMessage::Documents { documents, .. } => documents
                .iter()
                .map(|body| decode_document(body))
                .collect(),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(
        &self,
        collection: &str,
        handler: ChangeHandler,
    ) -> RemoteResult<Subscription> {
        let handler_id = self.shared.next_handler.fetch_add(1, Ordering::SeqCst);
        let first = self.shared.add_handler(collection, handler_id, handler);

        if first {
            let name = collection.to_string();
            let result = self
                .request(|request_id| ClientMessage::Subscribe {
                    request_id,
                    collection: name,
                })
                .await;
            if let Err(e) = result {
                self.shared.remove_handler(collection, handler_id);
                return Err(e);
            }
        }

        let shared = Arc::downgrade(&self.shared);
        let collection = collection.to_string();
        Ok(Subscription::new(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.remove_handler(&collection, handler_id) {
                if let Some(link) = shared.live_link() {
                    let request_id = shared.next_request_id();
                    let _ = send(
                        &link,
                        &ClientMessage::Unsubscribe {
                            request_id,
                            collection,
                        },
                    );
                }
            }
        }))
    }

    async fn ping(&self) -> RemoteResult<()> {
        match self
            .request(|request_id| ClientMessage::Ping { request_id })
            .await?
        {
            ServerMessage::Pong { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_lazy() {
        let remote = WsRemote::new("ws://127.0.0.1:9", Duration::from_millis(200));
        assert!(!remote.is_connected());
        assert!(remote.client_id().starts_with("edusync-"));
        assert_eq!(remote.url(), "ws://127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let remote = WsRemote::new(&format!("ws://127.0.0.1:{}", port), Duration::from_secs(2));
        assert_eq!(remote.ping().await, Err(RemoteError::Unavailable));
        assert!(!remote.is_connected());
    }
}
