//! obs-websocket (protocol v5) client over a blocking websocket.
//!
//! Only the four requests the overlay needs are issued. Every socket
//! operation carries a timeout so a stalled server surfaces as an error
//! instead of freezing the sampling loop.

use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tungstenite::{client::IntoClientRequest, http::HeaderValue, Message, WebSocket};

use super::{Connector, ItemId, Lookup, VisibilityClient};
use crate::{ObsConfig, Result, VoiceLayerError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const RPC_VERSION: u32 = 1;
const SUBPROTOCOL: &str = "obswebsocket.json";

const OP_HELLO: u8 = 0;
const OP_IDENTIFY: u8 = 1;
const OP_IDENTIFIED: u8 = 2;
const OP_REQUEST: u8 = 6;
const OP_REQUEST_RESPONSE: u8 = 7;

/// `requestStatus.code` for a scene or source that does not exist. Any other
/// rejection (not ready, studio mode, ...) says nothing about existence.
const RESOURCE_NOT_FOUND: i64 = 600;

type WireResult<T> = std::result::Result<T, String>;

#[derive(Debug, Serialize)]
struct Outgoing<'a, T> {
    op: u8,
    d: &'a T,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
struct Hello {
    #[serde(default)]
    authentication: Option<AuthChallenge>,
}

#[derive(Debug, Deserialize)]
struct AuthChallenge {
    challenge: String,
    salt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Identify {
    rpc_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    authentication: Option<String>,
    event_subscriptions: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Request<'a> {
    request_type: &'a str,
    request_id: String,
    request_data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestResponse {
    request_id: String,
    request_status: RequestStatus,
    #[serde(default)]
    response_data: Value,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    result: bool,
    code: i64,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SceneList {
    scenes: Vec<SceneEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneEntry {
    scene_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemList {
    scene_items: Vec<SceneItemEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemEntry {
    source_name: String,
    #[serde(default)]
    is_group: Option<bool>,
    #[serde(default)]
    source_kind: Option<String>,
}

impl SceneItemEntry {
    fn is_group(&self) -> bool {
        self.is_group == Some(true) || self.source_kind.as_deref() == Some("group")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneItemIdReply {
    scene_item_id: i64,
}

/// How the server answered a request that made it across the wire.
#[derive(Debug)]
enum Reply {
    Accepted(Value),
    Rejected { code: i64, comment: String },
}

/// Creates [`ObsClient`]s for one configured server.
#[derive(Debug, Clone)]
pub struct ObsConnector {
    config: ObsConfig,
}

impl ObsConnector {
    pub fn new(config: ObsConfig) -> Self {
        Self { config }
    }
}

impl Connector for ObsConnector {
    fn client(&self) -> Box<dyn VisibilityClient> {
        Box::new(ObsClient::new(self.config.clone()))
    }
}

/// One obs-websocket session. Unconnected until [`VisibilityClient::connect`].
pub struct ObsClient {
    config: ObsConfig,
    socket: Option<WebSocket<TcpStream>>,
    next_request: u64,
}

impl ObsClient {
    pub fn new(config: ObsConfig) -> Self {
        Self {
            config,
            socket: None,
            next_request: 0,
        }
    }

    fn handshake(&self) -> WireResult<WebSocket<TcpStream>> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        let stream = connect_any(host, port)?;
        stream
            .set_read_timeout(Some(REQUEST_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(REQUEST_TIMEOUT)))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|err| err.to_string())?;

        let mut request = format!("ws://{host}:{port}")
            .into_client_request()
            .map_err(|err| err.to_string())?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (mut socket, _) =
            tungstenite::client(request, stream).map_err(|err| format!("handshake: {err}"))?;

        let hello: Hello = expect(&mut socket, OP_HELLO)?;
        let authentication = hello
            .authentication
            .map(|auth| auth_response(&self.config.password, &auth.salt, &auth.challenge));
        send(
            &mut socket,
            OP_IDENTIFY,
            &Identify {
                rpc_version: RPC_VERSION,
                authentication,
                event_subscriptions: 0,
            },
        )?;
        let _: Value = expect(&mut socket, OP_IDENTIFIED)?;
        Ok(socket)
    }

    fn request(&mut self, request_type: &str, data: Value) -> WireResult<Reply> {
        self.next_request += 1;
        let request_id = self.next_request.to_string();
        let socket = self.socket.as_mut().ok_or("not connected")?;

        send(
            socket,
            OP_REQUEST,
            &Request {
                request_type,
                request_id: request_id.clone(),
                request_data: data,
            },
        )?;

        loop {
            let response: RequestResponse = expect(socket, OP_REQUEST_RESPONSE)?;
            if response.request_id != request_id {
                continue;
            }
            let status = response.request_status;
            return Ok(if status.result {
                Reply::Accepted(response.response_data)
            } else {
                Reply::Rejected {
                    code: status.code,
                    comment: status.comment.unwrap_or_default(),
                }
            });
        }
    }

    fn query<T: DeserializeOwned>(&mut self, request_type: &str, data: Value) -> Option<T> {
        match self.request(request_type, data) {
            Ok(Reply::Accepted(value)) => match serde_json::from_value(value) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    tracing::warn!(request_type, %err, "unexpected response shape");
                    None
                }
            },
            Ok(Reply::Rejected { code, comment }) => {
                tracing::warn!(request_type, code, %comment, "request rejected");
                None
            }
            Err(err) => {
                tracing::warn!(request_type, %err, "request failed");
                None
            }
        }
    }
}

impl VisibilityClient for ObsClient {
    fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        match self.handshake() {
            Ok(socket) => {
                tracing::info!(host = %self.config.host, port = self.config.port, "connected to OBS");
                self.socket = Some(socket);
                Ok(())
            }
            Err(err) => {
                tracing::error!(host = %self.config.host, port = self.config.port, %err, "OBS connection failed");
                Err(VoiceLayerError::Connection(err))
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None);
            let _ = socket.flush();
            tracing::info!("disconnected from OBS");
        }
    }

    fn list_scenes(&mut self) -> Vec<String> {
        self.query::<SceneList>("GetSceneList", json!({}))
            .map(|list| list.scenes.into_iter().map(|scene| scene.scene_name).collect())
            .unwrap_or_default()
    }

    fn list_groups_in_scene(&mut self, scene: &str) -> Vec<String> {
        self.query::<SceneItemList>("GetSceneItemList", json!({ "sceneName": scene }))
            .map(|list| {
                list.scene_items
                    .into_iter()
                    .filter(SceneItemEntry::is_group)
                    .map(|item| item.source_name)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn resolve_item_id(&mut self, container: &str, name: &str) -> Lookup {
        let data = json!({ "sceneName": container, "sourceName": name });
        match self.request("GetSceneItemId", data) {
            Ok(Reply::Accepted(value)) => match serde_json::from_value::<SceneItemIdReply>(value) {
                Ok(reply) => Lookup::Found(ItemId(reply.scene_item_id)),
                Err(err) => Lookup::Failed(format!("malformed GetSceneItemId reply: {err}")),
            },
            Ok(Reply::Rejected { code, .. }) if code == RESOURCE_NOT_FOUND => {
                tracing::trace!(container, name, "source not found");
                Lookup::Absent
            }
            Ok(Reply::Rejected { code, comment }) => Lookup::Failed(format!("{code}: {comment}")),
            Err(err) => Lookup::Failed(err),
        }
    }

    fn set_visible(&mut self, container: &str, item: ItemId, visible: bool) {
        let data = json!({
            "sceneName": container,
            "sceneItemId": item.0,
            "sceneItemEnabled": visible,
        });
        match self.request("SetSceneItemEnabled", data) {
            Ok(Reply::Accepted(_)) => {}
            Ok(Reply::Rejected { code, comment }) => {
                tracing::warn!(container, %item, visible, code, %comment, "visibility change rejected");
            }
            Err(err) => {
                tracing::warn!(container, %item, visible, %err, "visibility change failed");
            }
        }
    }
}

impl Drop for ObsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for ObsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObsClient")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

/// Tries every resolved address in turn, so an IPv6-first `localhost` still
/// reaches a server bound to IPv4 only.
fn connect_any(host: &str, port: u16) -> WireResult<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| format!("cannot resolve {host}:{port}: {err}"))?;

    let mut last_error = format!("no address for {host}:{port}");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(%addr, %err, "connect attempt failed");
                last_error = format!("{addr}: {err}");
            }
        }
    }
    Err(last_error)
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

fn send<T: Serialize>(socket: &mut WebSocket<TcpStream>, op: u8, d: &T) -> WireResult<()> {
    let text = serde_json::to_string(&Outgoing { op, d }).map_err(|err| err.to_string())?;
    socket
        .send(Message::Text(text))
        .map_err(|err| format!("send: {err}"))
}

/// Reads until a message with opcode `op` arrives, skipping anything else.
fn expect<T: DeserializeOwned>(socket: &mut WebSocket<TcpStream>, op: u8) -> WireResult<T> {
    loop {
        let message = socket.read().map_err(|err| format!("read: {err}"))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame
                    .map(|frame| format!("{} {}", u16::from(frame.code), frame.reason))
                    .unwrap_or_else(|| "no reason".to_string());
                return Err(format!("closed by server: {reason}"));
            }
            _ => continue,
        };

        let incoming: Incoming =
            serde_json::from_str(&text).map_err(|err| format!("malformed message: {err}"))?;
        if incoming.op != op {
            tracing::trace!(op = incoming.op, "skipping message");
            continue;
        }
        return serde_json::from_value(incoming.d).map_err(|err| format!("malformed payload: {err}"));
    }
}
