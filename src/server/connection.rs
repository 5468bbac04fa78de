//! WebSocket connection handling
//!
//! One [`Connection`] per accepted socket. The route and query are checked
//! during the HTTP upgrade; anything needing the store (user lookup, token
//! and membership checks) runs right after it, and a rejection is sent as a
//! close frame before the session is attached.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use super::gateway::{Attached, Gateway};
use crate::chat::domain::parse_id;
use crate::error::{Error, Result};

/// Where a connection attaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/match?uid=<id>`
    Match { user_id: u64 },
    /// `/chat?uid=<id>&access_token=<token>`
    Chat { user_id: u64, access_token: String },
}

impl Route {
    /// Parse the upgrade request target
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let mut uid = None;
        let mut access_token = None;
        if let Some(query) = uri.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match name.as_ref() {
                    "uid" => uid = Some(value.into_owned()),
                    "access_token" => access_token = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        let user_id = match uid {
            Some(uid) => parse_id(&uid)?,
            None => return Err(Error::Validation("missing uid".into())),
        };

        match uri.path().trim_end_matches('/') {
            "/match" => Ok(Route::Match { user_id }),
            "/chat" => match access_token {
                Some(access_token) if !access_token.is_empty() => Ok(Route::Chat {
                    user_id,
                    access_token,
                }),
                _ => Err(Error::Validation("missing access_token".into())),
            },
            other => Err(Error::Validation(format!("unknown path {}", other))),
        }
    }
}

/// A single client connection
pub struct Connection {
    session_id: u64,
    socket: Option<TcpStream>,
    peer_addr: SocketAddr,
    gateway: Arc<Gateway>,
}

impl Connection {
    pub fn new(
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        gateway: Arc<Gateway>,
    ) -> Self {
        Self {
            session_id,
            socket: Some(socket),
            peer_addr,
            gateway,
        }
    }

    /// Upgrade, attach, and serve the connection until either side closes
    pub async fn run(&mut self) -> Result<()> {
        let socket = self
            .socket
            .take()
            .ok_or_else(|| Error::Validation("connection already ran".into()))?;

        let mut route = None;
        let mut ws = tokio_tungstenite::accept_hdr_async(
            socket,
            |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                match Route::from_uri(req.uri()) {
                    Ok(r) => {
                        route = Some(r);
                        Ok(resp)
                    }
                    Err(e) => Err(reject(&e)),
                }
            },
        )
        .await?;

        let route = route.ok_or_else(|| Error::Validation("upgrade without route".into()))?;
        tracing::debug!(
            session_id = self.session_id,
            peer = %self.peer_addr,
            route = ?route,
            "WebSocket upgraded"
        );

        let attached = match &route {
            Route::Match { user_id } => {
                self.gateway
                    .connect_match(*user_id, Some(self.peer_addr))
                    .await
            }
            Route::Chat {
                user_id,
                access_token,
            } => {
                self.gateway
                    .connect_chat(*user_id, access_token, Some(self.peer_addr))
                    .await
            }
        };

        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                let frame = CloseFrame {
                    code: close_code(&e),
                    reason: e.to_string().into(),
                };
                let _ = ws.close(Some(frame)).await;
                return Err(e);
            }
        };

        self.serve(ws, attached, &route).await
    }

    async fn serve(
        &self,
        ws: WebSocketStream<TcpStream>,
        attached: Attached,
        route: &Route,
    ) -> Result<()> {
        let Attached { session, outbound } = attached;
        let (sink, mut stream) = ws.split();
        let writer = tokio::spawn(write_loop(sink, outbound));

        let mut result = Ok(());
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            };

            let data: &[u8] = match &frame {
                WsMessage::Text(text) => text.as_bytes(),
                WsMessage::Binary(data) => &data[..],
                WsMessage::Close(_) => break,
                _ => continue,
            };

            // Match sessions only listen
            if let Route::Chat { .. } = route {
                if let Err(e) = self.gateway.handle_chat_frame(&session, data).await {
                    if is_client_fault(&e) {
                        tracing::warn!(
                            session_id = self.session_id,
                            error = %e,
                            "Dropped chat frame"
                        );
                    } else {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        let cleanup = match route {
            Route::Match { .. } => self.gateway.disconnect_match(&session).await,
            Route::Chat { .. } => self.gateway.disconnect_chat(&session).await,
        };
        writer.abort();

        if let Err(e) = cleanup {
            tracing::error!(
                session_id = self.session_id,
                user_id = session.attrs().user_id,
                error = %e,
                "Failed to clean up session"
            );
        }
        result
    }
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<Bytes>)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        let text = String::from_utf8_lossy(&payload).into_owned();
        if sink.send(WsMessage::text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Errors caused by a single bad frame; the connection survives them
fn is_client_fault(err: &Error) -> bool {
    matches!(
        err.root(),
        Error::Validation(_) | Error::Codec(_) | Error::RateLimited
    )
}

fn close_code(err: &Error) -> CloseCode {
    match err.root() {
        Error::Auth(_) | Error::NotChannelMember { .. } => CloseCode::Policy,
        Error::Validation(_) | Error::UserNotFound(_) | Error::ChannelNotFound(_) => {
            CloseCode::Invalid
        }
        _ => CloseCode::Error,
    }
}

fn reject(err: &Error) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(err.to_string()));
    *resp.status_mut() = match err {
        Error::Validation(msg) if msg.starts_with("unknown path") => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    resp
}
