//! QUIC server that exposes the controller and identity services and
//! dispatches incoming CSI requests to them.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::{CsiMessage, dispatch};
use crate::serializer::CallContext;

/// Upper bound on a single request or response body.
pub(crate) const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to a [`CsiIdentity`] + [`CsiController`]
/// implementation.
///
/// Every request runs with a [`CallContext`] that is cancelled when its
/// connection closes or the server shuts down.
pub struct CsiServer<T> {
    endpoint: quinn::Endpoint,
    handler: Arc<T>,
    shutdown: CancellationToken,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + 'static,
{
    /// Create a new server bound to `addr`.
    ///
    /// `tls_config` is typically built from a certificate and key signed by
    /// `libvault`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        handler: Arc<T>,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self {
            endpoint,
            handler,
            shutdown: CancellationToken::new(),
        })
    }

    /// Accept connections until [`Self::shutdown`] is called or the endpoint
    /// is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        loop {
            let incoming = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            let handler = Arc::clone(&self.handler);
            let conn_token = self.shutdown.child_token();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, handler, conn_token).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        info!("CSI QUIC server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting connections and cancel in-flight requests.
    ///
    /// Cancelled requests still finish their backend work in the background.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(
        conn: quinn::Connection,
        handler: Arc<T>,
        token: CancellationToken,
    ) -> Result<(), CsiError> {
        // Cancel outstanding requests once the peer goes away.
        let _cancel_on_exit = token.clone().drop_guard();

        loop {
            let (send, recv) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                stream = conn.accept_bi() => match stream {
                    Ok(stream) => stream,
                    Err(quinn::ConnectionError::ApplicationClosed(_))
                    | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                    Err(e) => return Err(CsiError::transport(e)),
                },
            };

            let handler = Arc::clone(&handler);
            let ctx = CallContext::with_token(token.child_token());
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &*handler, &ctx).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        handler: &T,
        ctx: &CallContext,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_MESSAGE_BYTES)
            .await
            .map_err(CsiError::transport)?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                dispatch(handler, ctx, request).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };
        debug!(%response, "CSI response ready");

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// Return a reference to the underlying QUIC endpoint, useful for
    /// obtaining the local address.
    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }
}
