//! JSON-RPC client for the daemon's websocket endpoint
//!
//! A write pump serialises outbound frames and a read pump routes responses to
//! waiting callers by request id. Notifications are re-dispatched as
//! [`DaemonEvent`]s on an unbounded channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{AddOptions, DaemonError, DaemonEvent, DaemonRpc, StatusSnapshot};

type Reply = Result<Value, DaemonError>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Any frame the daemon sends: a response (has `id`) or a notification
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

pub struct Aria2Client {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    secret: Option<String>,
    request_timeout: Duration,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl Aria2Client {
    /// Opens the websocket and starts both pumps. Notifications go to `events`
    /// until the connection closes.
    pub async fn connect(
        url: &str,
        secret: Option<String>,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Result<Self, DaemonError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(read_pump(
            read,
            pending.clone(),
            events,
            write_tx.clone(),
            cancel.clone(),
        ));

        debug!(url, "Connected to download daemon");

        Ok(Self {
            write_tx,
            pending,
            next_id: AtomicU64::new(1),
            secret,
            request_timeout,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends one request and waits for the matching response
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, DaemonError> {
        if self.is_closed() {
            return Err(DaemonError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all_params.push(Value::String(format!("token:{}", secret)));
        }
        all_params.extend(params);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": all_params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        trace!(method, id = %id, "Daemon request");
        if self
            .write_tx
            .send(tungstenite::Message::Text(request.to_string().into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(DaemonError::Closed);
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(DaemonError::Closed),
            Err(_) => Err(DaemonError::Timeout),
        }
    }

    /// Stops both pumps; in-flight requests fail with [`DaemonError::Closed`]
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Aria2Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl DaemonRpc for Aria2Client {
    async fn add_uri(&self, uris: &[String], options: &AddOptions) -> Result<String, DaemonError> {
        let result = self
            .call("aria2.addUri", vec![json!(uris), options.to_value()])
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn add_torrent(&self, torrent: &str, options: &AddOptions) -> Result<String, DaemonError> {
        let result = self
            .call(
                "aria2.addTorrent",
                vec![json!(torrent), json!([]), options.to_value()],
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn tell_status(&self, gid: &str, keys: &[&str]) -> Result<StatusSnapshot, DaemonError> {
        let mut params = vec![json!(gid)];
        if !keys.is_empty() {
            params.push(json!(keys));
        }
        let result = self.call("aria2.tellStatus", params).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn pause(&self, gid: &str) -> Result<(), DaemonError> {
        self.call("aria2.pause", vec![json!(gid)]).await.map(|_| ())
    }

    async fn remove(&self, gid: &str, force: bool) -> Result<(), DaemonError> {
        let method = if force { "aria2.forceRemove" } else { "aria2.remove" };
        self.call(method, vec![json!(gid)]).await.map(|_| ())
    }

    async fn get_version(&self) -> Result<String, DaemonError> {
        #[derive(Deserialize)]
        struct Version {
            version: String,
        }
        let result = self.call("aria2.getVersion", Vec::new()).await?;
        let version: Version = serde_json::from_value(result)?;
        Ok(version.version)
    }

    async fn shutdown(&self) -> Result<(), DaemonError> {
        let result = self.call("aria2.shutdown", Vec::new()).await;
        self.close();
        match result {
            // The daemon may hang up before answering
            Ok(_) | Err(DaemonError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The daemon reports unknown gids as code 1, "GID <gid> is not found"
fn rpc_error(body: RpcErrorBody) -> DaemonError {
    if body.code == 1 && body.message.contains("not found") {
        let gid = body
            .message
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();
        return DaemonError::NotFound(gid);
    }
    DaemonError::Rpc {
        code: body.code,
        message: body.message,
    }
}

fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Routes one text frame: responses to their waiter, notifications to `events`
async fn handle_text(
    text: &str,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<DaemonEvent>,
) {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse daemon frame: {e}");
            return;
        }
    };

    if let Some(id) = incoming.id.as_ref().filter(|id| !id.is_null()) {
        let key = id_key(id);
        let Some(tx) = pending.lock().await.remove(&key) else {
            debug!(id = %key, "Response for unknown request dropped");
            return;
        };
        let reply = match (incoming.error, incoming.result) {
            (Some(err), _) => Err(rpc_error(err)),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
        return;
    }

    let Some(method) = incoming.method else {
        return;
    };
    let gid = incoming
        .params
        .first()
        .and_then(|p| p.get("gid"))
        .and_then(Value::as_str);
    match (gid, DaemonEvent::from_notification(&method, gid.unwrap_or_default().to_string())) {
        (Some(_), Some(event)) => {
            trace!(?event, "Daemon notification");
            let _ = events.send(event);
        }
        _ => debug!(method = %method, "Ignoring daemon notification"),
    }
}

async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    events: mpsc::UnboundedSender<DaemonEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    handle_text(&text, &pending, &events).await;
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                }
                Some(Ok(tungstenite::Message::Close(_))) => {
                    debug!("Daemon closed the websocket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Daemon websocket read error: {e}");
                    break;
                }
                None => break,
            }
        }
    }

    cancel.cancel();
    // Dropping the senders fails every waiter with Closed
    pending.lock().await.clear();
}

async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => match msg {
                Some(m) => {
                    if let Err(e) = write.send(m).await {
                        warn!("Daemon websocket write error: {e}");
                        break;
                    }
                }
                None => break,
            }
        }
    }

    cancel.cancel();
    let _ = write.send(tungstenite::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_response_routed_to_waiter() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("7".into(), tx);

        handle_text(
            r#"{"jsonrpc":"2.0","id":"7","result":"2089b05ecca3d829"}"#,
            &pending,
            &events_tx,
        )
        .await;

        assert_eq!(rx.await.unwrap().unwrap(), json!("2089b05ecca3d829"));
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_not_found_error_classified() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("3".into(), tx);

        handle_text(
            r#"{"jsonrpc":"2.0","id":"3","error":{"code":1,"message":"GID 2089b05ecca3d829 is not found"}}"#,
            &pending,
            &events_tx,
        )
        .await;

        match rx.await.unwrap() {
            Err(DaemonError::NotFound(gid)) => assert_eq!(gid, "2089b05ecca3d829"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_rpc_error_kept() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("4".into(), tx);

        handle_text(
            r#"{"jsonrpc":"2.0","id":"4","error":{"code":1,"message":"Unauthorized"}}"#,
            &pending,
            &events_tx,
        )
        .await;

        assert!(matches!(rx.await.unwrap(), Err(DaemonError::Rpc { code: 1, .. })));
    }

    #[tokio::test]
    async fn test_notification_dispatched() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        handle_text(
            r#"{"jsonrpc":"2.0","method":"aria2.onDownloadComplete","params":[{"gid":"abc"}]}"#,
            &pending,
            &events_tx,
        )
        .await;
        handle_text(
            r#"{"jsonrpc":"2.0","method":"aria2.onDownloadPause","params":[{"gid":"abc"}]}"#,
            &pending,
            &events_tx,
        )
        .await;
        handle_text("not json", &pending, &events_tx).await;

        assert_eq!(events_rx.try_recv().unwrap(), DaemonEvent::Complete("abc".into()));
        assert!(events_rx.try_recv().is_err());
    }

    /// Minimal daemon: answers getVersion, pushes one start notification, then
    /// echoes the token param back as the result of any other call.
    async fn spawn_fake_daemon() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let tungstenite::Message::Text(text) = msg else { continue };
                let req: Value = serde_json::from_str(&text).unwrap();
                let result = if req["method"] == "aria2.getVersion" {
                    json!({"version": "1.37.0", "enabledFeatures": []})
                } else {
                    req["params"][0].clone()
                };
                let notify = json!({
                    "jsonrpc": "2.0",
                    "method": "aria2.onDownloadStart",
                    "params": [{"gid": "feedfacecafebeef"}]
                });
                ws.send(tungstenite::Message::Text(notify.to_string().into()))
                    .await
                    .unwrap();
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
                ws.send(tungstenite::Message::Text(reply.to_string().into()))
                    .await
                    .unwrap();
            }
        });
        format!("ws://{}/jsonrpc", addr)
    }

    #[tokio::test]
    async fn test_round_trip_over_websocket() {
        let url = spawn_fake_daemon().await;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let client = Aria2Client::connect(
            &url,
            Some("s3cret".into()),
            Duration::from_secs(5),
            events_tx,
        )
        .await
        .unwrap();

        assert_eq!(client.get_version().await.unwrap(), "1.37.0");
        let echoed = client.call("aria2.tellActive", Vec::new()).await.unwrap();
        assert_eq!(echoed, json!("token:s3cret"));

        assert_eq!(
            events_rx.recv().await.unwrap(),
            DaemonEvent::Start("feedfacecafebeef".into())
        );

        client.close();
        assert!(matches!(
            client.call("aria2.tellActive", Vec::new()).await,
            Err(DaemonError::Closed)
        ));
    }
}
