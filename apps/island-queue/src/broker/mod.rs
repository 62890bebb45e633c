pub mod protocol;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::ORIGIN};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::QueueError;
use protocol::{ClientMessage, ServerMessage};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Identity the broker assigns to one queue participant. Never empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VisitorId(String);

impl VisitorId {
    pub fn new(raw: impl Into<String>) -> Result<Self, QueueError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(QueueError::Transport(
                "broker assigned an empty visitor id".into(),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keeps the broker connection alive for the lifetime of a session.
#[async_trait]
pub trait SessionHandle: Send {
    async fn close(self: Box<Self>);
}

/// An open broker connection together with the identity it was assigned.
pub struct BrokerSession {
    target: String,
    visitor_id: VisitorId,
    handle: Option<Box<dyn SessionHandle>>,
}

impl BrokerSession {
    pub fn new(
        target: impl Into<String>,
        visitor_id: VisitorId,
        handle: Box<dyn SessionHandle>,
    ) -> Self {
        Self {
            target: target.into(),
            visitor_id,
            handle: Some(handle),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn visitor_id(&self) -> &VisitorId {
        &self.visitor_id
    }

    pub async fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
        tracing::debug!(
            target: "island_queue::broker",
            island = %self.target,
            visitor_id = %self.visitor_id,
            "broker session closed"
        );
    }
}

impl fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("target", &self.target)
            .field("visitor_id", &self.visitor_id)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection, announces `target` and resolves on the first
    /// `joined` reply.
    async fn establish(&self, target: &str) -> Result<BrokerSession, QueueError>;
}

#[derive(Clone, Debug)]
pub struct WebSocketBroker {
    url: Url,
    origin: Option<String>,
    handshake_timeout: Option<Duration>,
}

impl WebSocketBroker {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            origin: None,
            handshake_timeout: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    /// `None` waits for `joined` indefinitely.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn handshake(&self, target: &str) -> Result<BrokerSession, QueueError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(origin) = &self.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|err| QueueError::InvalidConfig(format!("invalid origin: {err}")))?;
            request.headers_mut().insert(ORIGIN, value);
        }

        let (mut ws, _) = connect_async(request).await?;
        tracing::debug!(
            target: "island_queue::broker",
            url = %self.url,
            island = %target,
            "broker connection open"
        );

        let join = serde_json::to_string(&ClientMessage::join(target))
            .map_err(|err| QueueError::Transport(format!("failed to encode join: {err}")))?;
        ws.send(Message::Text(join)).await?;

        let visitor_id = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)
                {
                    Ok(ServerMessage::Joined { data }) => break VisitorId::new(data.visitor_id)?,
                    Ok(ServerMessage::Other) => {
                        tracing::debug!(
                            target: "island_queue::broker",
                            payload = %text,
                            "ignoring broker message while waiting for joined"
                        );
                    }
                    Err(err) => {
                        tracing::debug!(
                            target: "island_queue::broker",
                            error = %err,
                            payload = %text,
                            "ignoring undecodable broker message"
                        );
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return Err(QueueError::Transport(format!(
                        "broker closed the connection before joining: {frame:?}"
                    )));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => {
                    return Err(QueueError::Transport(
                        "broker stream ended before joining".into(),
                    ));
                }
            }
        };

        tracing::info!(
            target: "island_queue::broker",
            island = %target,
            visitor_id = %visitor_id,
            "visitor id assigned"
        );
        Ok(BrokerSession::new(
            target,
            visitor_id,
            Box::new(WebSocketHandle::spawn(ws)),
        ))
    }
}

#[async_trait]
impl Broker for WebSocketBroker {
    async fn establish(&self, target: &str) -> Result<BrokerSession, QueueError> {
        match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, self.handshake(target))
                .await
                .map_err(|_| {
                    QueueError::Transport(format!("no joined message within {limit:?}"))
                })?,
            None => self.handshake(target).await,
        }
    }
}

/// Drains the socket after the handshake until asked to close. Dropping the
/// handle without calling `close` also shuts the connection down.
struct WebSocketHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketHandle {
    fn spawn(mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Also fires when the handle is dropped without close().
                    _ = &mut shutdown_rx => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            tracing::trace!(
                                target: "island_queue::broker",
                                payload = %text,
                                "broker message after join"
                            );
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::debug!(target: "island_queue::broker", "broker closed the connection");
                            break;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(target: "island_queue::broker", error = %err, "broker connection failed");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        });
        Self {
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }
}

#[async_trait]
impl SessionHandle for WebSocketHandle {
    async fn close(mut self: Box<Self>) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                tracing::warn!(
                    target: "island_queue::broker",
                    "broker connection did not close within grace period"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct Observed {
        join: Arc<Mutex<Option<serde_json::Value>>>,
        origin: Arc<Mutex<Option<String>>>,
        closed: Arc<tokio::sync::Notify>,
    }

    async fn spawn_broker(replies: Vec<String>, observed: Observed) -> Url {
        let app = Router::new().route(
            "/production",
            get(move |ws: WebSocketUpgrade, headers: HeaderMap| {
                let replies = replies.clone();
                let observed = observed.clone();
                async move {
                    *observed.origin.lock().await = headers
                        .get("origin")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    ws.on_upgrade(move |socket| serve(socket, replies, observed))
                        .into_response()
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("ws://{addr}/production")).unwrap()
    }

    async fn serve(mut socket: WebSocket, replies: Vec<String>, observed: Observed) {
        if let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
            *observed.join.lock().await = serde_json::from_str(&text).ok();
        }
        for reply in replies {
            if socket.send(AxumMessage::Text(reply)).await.is_err() {
                return;
            }
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, AxumMessage::Close(_)) {
                break;
            }
        }
        observed.closed.notify_one();
    }

    #[test]
    fn visitor_id_rejects_empty_identity() {
        assert!(matches!(VisitorId::new(""), Err(QueueError::Transport(_))));
        assert!(matches!(VisitorId::new("   "), Err(QueueError::Transport(_))));
        assert_eq!(VisitorId::new("V1").unwrap().as_str(), "V1");
    }

    #[test_timeout::tokio_timeout_test]
    async fn handshake_skips_unrelated_messages_and_returns_identity() {
        let observed = Observed::default();
        let url = spawn_broker(
            vec![
                r#"{"action":"queueSize","data":{"size":3}}"#.into(),
                "not json".into(),
                r#"{"action":"joined","data":{"visitorID":"V1"}}"#.into(),
                r#"{"action":"joined","data":{"visitorID":"V2"}}"#.into(),
            ],
            observed.clone(),
        )
        .await;
        let broker = WebSocketBroker::new(url)
            .with_origin(Some("https://turnip.exchange".into()))
            .with_handshake_timeout(Some(Duration::from_secs(5)));

        let session = broker.establish("ABC123").await.unwrap();
        assert_eq!(session.visitor_id().as_str(), "V1");
        assert_eq!(session.target(), "ABC123");

        let join = observed.join.lock().await.clone().unwrap();
        assert_eq!(
            join,
            serde_json::json!({ "action": "join", "turnipCode": "ABC123", "visitorID": null })
        );
        assert_eq!(
            observed.origin.lock().await.as_deref(),
            Some("https://turnip.exchange")
        );

        let closed = observed.closed.notified();
        session.close().await;
        closed.await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn handshake_times_out_as_transport_error() {
        let url = spawn_broker(Vec::new(), Observed::default()).await;
        let broker =
            WebSocketBroker::new(url).with_handshake_timeout(Some(Duration::from_millis(200)));

        let err = broker.establish("ABC123").await.unwrap_err();
        assert!(matches!(err, QueueError::Transport(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn empty_identity_is_a_transport_error() {
        let url = spawn_broker(
            vec![r#"{"action":"joined","data":{"visitorID":""}}"#.into()],
            Observed::default(),
        )
        .await;
        let broker = WebSocketBroker::new(url);

        let err = broker.establish("ABC123").await.unwrap_err();
        assert!(matches!(err, QueueError::Transport(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unreachable_broker_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let broker = WebSocketBroker::new(Url::parse(&format!("ws://{addr}/production")).unwrap())
            .with_handshake_timeout(Some(Duration::from_secs(5)));

        let err = broker.establish("ABC123").await.unwrap_err();
        assert!(matches!(err, QueueError::Transport(_)));
    }
}
