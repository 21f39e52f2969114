//! One session per TCP (or TLS) connection. The session frames the byte
//! stream, drives the authentication handshake, then shuttles messages
//! between its socket and the hub.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use squawkbus_protocol::v1::{Message, frame::MessageCodec};

use crate::authentication::AuthenticationManager;
use crate::hub::SessionEvent;
use crate::{BrokerError, OUTBOUND_QUEUE, SessionId};

/// Drive a connection to completion. Errors close the socket with no in-band
/// message; the caller logs them.
pub async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    session: SessionId,
    hub_tx: mpsc::Sender<SessionEvent>,
    authentication: Arc<AuthenticationManager>,
) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, MessageCodec);
    let (mut writer, mut reader) = framed.split();

    // AwaitingAuth: the first frame must carry credentials. Nothing is
    // registered with the hub until they check out.
    let first = match reader.next().await {
        Some(frame) => frame?,
        None => return Ok(()),
    };
    let Message::AuthenticationRequest(request) = first else {
        return Err(BrokerError::ProtocolViolation(
            "expected authentication request",
        ));
    };
    let Some(user) = authentication.authenticate(&request.method, &request.data) else {
        return Err(BrokerError::AuthenticationFailed);
    };

    let host = peer.ip().to_string();
    let client_id = format!("{host}:{}", peer.port());
    tracing::debug!(%client_id, %user, "authenticated");

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();

    // Writer task: drains the outbound queue onto the socket.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if writer.send(message).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    if hub_tx
        .send(SessionEvent::Connect {
            session,
            client_id,
            host,
            user,
            tx,
            cancel: cancel.clone(),
        })
        .await
        .is_err()
    {
        // The hub is shutting down; the writer exits once the queue drops.
        return Ok(());
    }

    let result = read_loop(&mut reader, session, &hub_tx, &cancel).await;

    let _ = hub_tx.send(SessionEvent::Close { session }).await;
    let _ = writer_task.await;
    result
}

async fn read_loop<R>(
    reader: &mut R,
    session: SessionId,
    hub_tx: &mpsc::Sender<SessionEvent>,
    cancel: &CancellationToken,
) -> Result<(), BrokerError>
where
    R: Stream<Item = Result<Message, squawkbus_protocol::v1::error::ProtocolError>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next() => match frame {
                Some(Ok(message)) => {
                    if hub_tx
                        .send(SessionEvent::Message { session, message })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Ok(()),
            },
        }
    }
}
