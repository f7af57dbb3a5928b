use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::get;
use axum::{
    extract::ws::{Message, WebSocket},
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use abi::config::Config;
use abi::errors::Error;
use abi::model::ClientFrame;
use db::DbRepo;

use crate::client::Client;
use crate::hub::Hub;

pub const HEART_BEAT_INTERVAL: u64 = 30;
pub const SESSION_COOKIE: &str = "session_id";

const WRITE_QUEUE_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    hub: Hub,
    allowed_origins: Vec<String>,
}

pub struct WsServer;

impl WsServer {
    pub async fn start(config: Config, db: DbRepo) -> Result<(), Error> {
        let app_state = AppState {
            hub: Hub::new(Arc::new(db)),
            allowed_origins: config.server.allowed_origins.clone(),
        };

        let router = Router::new()
            .route("/ws", get(Self::websocket_handler))
            .with_state(app_state);
        let addr = config.server.url();

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("start websocket server on {}", addr);
        axum::serve(listener, router).await?;
        Ok(())
    }

    /// authenticate before the upgrade: the browser's session cookie must
    /// resolve to a known user, otherwise the handshake is refused
    pub async fn websocket_handler(
        ws: WebSocketUpgrade,
        headers: HeaderMap,
        State(state): State<AppState>,
    ) -> Result<Response, Error> {
        check_origin(&headers, &state.allowed_origins)?;

        let session_id =
            session_cookie(&headers).ok_or_else(|| Error::unauthorized("missing session cookie"))?;
        let name = state
            .hub
            .resolve_identity(&session_id)
            .await?
            .ok_or_else(|| Error::unauthorized("unknown session"))?;

        Ok(ws.on_upgrade(move |socket| Self::websocket(name, socket, state.hub)))
    }

    pub async fn websocket(name: String, ws: WebSocket, hub: Hub) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::channel::<Message>(WRITE_QUEUE_CAPACITY);

        hub.connect(name.clone(), Client::new(name.clone(), tx.clone()))
            .await;

        // single writer: everything reaches the socket through the queue,
        // so hub fan-out never touches the sink directly
        let mut send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_tx.send(msg).await {
                    error!("send message error: {:?}", e);
                    break;
                }
            }
        });

        // send ping message to client
        let ping_tx = tx.clone();
        let mut ping_task = tokio::spawn(async move {
            loop {
                if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    // queue closed, this conn is going away
                    break;
                }
                tokio::time::sleep(Duration::from_secs(HEART_BEAT_INTERVAL)).await;
            }
        });

        // receive message from client
        let cloned_hub = hub.clone();
        let conn_name = name.clone();
        let pong_tx = tx.clone();
        let mut rec_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_rx.next().await {
                match msg {
                    Message::Text(text) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(
                                    "malformed frame from {}: {}; source: {}",
                                    conn_name, e, text
                                );
                                continue;
                            }
                        };
                        cloned_hub.handle_frame(&conn_name, frame).await;
                    }
                    Message::Ping(payload) => {
                        if pong_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(info) => {
                        if let Some(info) = info {
                            debug!("{} closed: {}", conn_name, info.reason);
                        }
                        break;
                    }
                    Message::Binary(_) => {
                        warn!("ignoring binary frame from {}", conn_name);
                    }
                }
            }
        });

        tokio::select! {
            _ = (&mut send_task) => {ping_task.abort(); rec_task.abort();},
            _ = (&mut ping_task) => {send_task.abort(); rec_task.abort();},
            _ = (&mut rec_task) => {send_task.abort(); ping_task.abort();},
        }

        // lost the connection, remove it and tell everyone else
        hub.disconnect(&name).await;
    }
}

fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), Error> {
    if allowed.is_empty() {
        return Ok(());
    }
    match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        // non-browser clients send no Origin header
        None => Ok(()),
        Some(origin) if allowed.iter().any(|a| a == origin) => Ok(()),
        Some(origin) => Err(Error::unauthorized(format!(
            "origin {origin} is not allowed"
        ))),
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let map = headers(&[("cookie", "theme=dark; session_id=abc123; lang=en")]);
        assert_eq!(session_cookie(&map).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_session_cookie() {
        assert!(session_cookie(&headers(&[("cookie", "theme=dark")])).is_none());
        assert!(session_cookie(&headers(&[])).is_none());
    }

    #[test]
    fn origin_check_honors_allow_list() {
        let allowed = vec!["http://localhost:8080".to_string()];

        let ok = headers(&[("origin", "http://localhost:8080")]);
        assert!(check_origin(&ok, &allowed).is_ok());

        let bad = headers(&[("origin", "http://evil.example")]);
        assert!(check_origin(&bad, &allowed).is_err());

        // no Origin header passes, an empty allow-list disables the check
        assert!(check_origin(&headers(&[]), &allowed).is_ok());
        assert!(check_origin(&bad, &[]).is_ok());
    }
}
