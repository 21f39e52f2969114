//! Async client for the squawkbus broker.
//!
//! A [`Client`] connects, authenticates, and then exposes subscribe/listen/
//! publish calls plus a stream of the messages the broker routes back. There
//! is no request/response correlation in the protocol: requests are
//! fire-and-forget, and a rejected handshake shows up as the server closing
//! the connection.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;

use squawkbus_protocol::v1::frame::{FrameBuffer, MessageCodec};
use squawkbus_protocol::v1::{
    AuthenticationRequest, DataPacket, Message, MulticastData, NotificationRequest,
    SubscriptionRequest, UnicastData,
};
use tokio_util::codec::Framed;

/// How to introduce ourselves to the broker.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub method: String,
    pub data: Vec<u8>,
}

impl Credentials {
    /// Anonymous; the broker names us `nobody`.
    pub fn none() -> Self {
        Credentials {
            method: "NONE".into(),
            data: Vec::new(),
        }
    }

    /// Self-asserted user name.
    pub fn plain(user: impl Into<String>) -> Self {
        Credentials {
            method: "PLAIN".into(),
            data: user.into().into_bytes(),
        }
    }

    /// Username and password, carried as one nested frame.
    pub fn htpasswd(user: &str, password: &str) -> Self {
        let mut body = FrameBuffer::new();
        body.put_str(user);
        body.put_str(password);
        let body = body.into_vec();

        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(&body);
        Credentials {
            method: "HTPASSWD".into(),
            data,
        }
    }
}

pub struct Client {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
    local_addr: SocketAddr,
}

impl Client {
    /// Connect and authenticate. Authentication failures are only observable
    /// as the broker dropping the connection, which surfaces as `recv`
    /// returning `None` and sends failing.
    pub async fn connect(addr: impl ToSocketAddrs, credentials: Credentials) -> anyhow::Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        let local_addr = stream.local_addr()?;
        let framed = Framed::new(stream, MessageCodec);
        let (mut writer, mut reader) = framed.split();

        writer
            .send(Message::AuthenticationRequest(AuthenticationRequest {
                method: credentials.method,
                data: credentials.data,
            }))
            .await?;

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);
        let (inbound_tx, inbound) = mpsc::channel::<Message>(64);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        tokio::spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(message)) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::debug!(%error, "client connection failed");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(Client {
            outbound,
            inbound,
            local_addr,
        })
    }

    /// The identity the broker will route unicast data to: `host:port` of
    /// this connection as the broker sees it.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> anyhow::Result<()> {
        self.subscription(topic, true).await
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> anyhow::Result<()> {
        self.subscription(topic, false).await
    }

    async fn subscription(&self, topic: impl Into<String>, is_add: bool) -> anyhow::Result<()> {
        self.send(Message::SubscriptionRequest(SubscriptionRequest {
            topic: topic.into(),
            is_add,
        }))
        .await
    }

    pub async fn listen(&self, pattern: impl Into<String>) -> anyhow::Result<()> {
        self.notification(pattern, true).await
    }

    pub async fn unlisten(&self, pattern: impl Into<String>) -> anyhow::Result<()> {
        self.notification(pattern, false).await
    }

    async fn notification(&self, pattern: impl Into<String>, is_add: bool) -> anyhow::Result<()> {
        self.send(Message::NotificationRequest(NotificationRequest {
            pattern: pattern.into(),
            is_add,
        }))
        .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        data_packets: Vec<DataPacket>,
    ) -> anyhow::Result<()> {
        self.send(Message::MulticastData(MulticastData {
            topic: topic.into(),
            data_packets,
        }))
        .await
    }

    /// Send directly to one client by its broker-assigned id (`host:port`).
    pub async fn send_to(
        &self,
        client_id: impl Into<String>,
        topic: impl Into<String>,
        data_packets: Vec<DataPacket>,
    ) -> anyhow::Result<()> {
        self.send(Message::UnicastData(UnicastData {
            client_id: client_id.into(),
            topic: topic.into(),
            data_packets,
        }))
        .await
    }

    /// Next routed message; `None` once the broker closes the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    async fn send(&self, message: Message) -> anyhow::Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}
