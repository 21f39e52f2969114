pub mod error;
pub mod frame;

use std::collections::HashSet;

use crate::v1::{error::ProtocolError, frame::FrameBuffer};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 22000;

/// Wire discriminant, the first byte of every frame body.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    AuthenticationRequest = 1,
    AuthenticationResponse = 2,
    MulticastData = 3,
    UnicastData = 4,
    ForwardedSubscriptionRequest = 5,
    NotificationRequest = 6,
    SubscriptionRequest = 7,
    ForwardedMulticastData = 8,
    ForwardedUnicastData = 9,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageKind::AuthenticationRequest),
            2 => Ok(MessageKind::AuthenticationResponse),
            3 => Ok(MessageKind::MulticastData),
            4 => Ok(MessageKind::UnicastData),
            5 => Ok(MessageKind::ForwardedSubscriptionRequest),
            6 => Ok(MessageKind::NotificationRequest),
            7 => Ok(MessageKind::SubscriptionRequest),
            8 => Ok(MessageKind::ForwardedMulticastData),
            9 => Ok(MessageKind::ForwardedUnicastData),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// The payload unit. A packet is public when its entitlement is 0; otherwise
/// it is delivered only to users whose entitlement set contains the tag.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    pub entitlement: i32,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl DataPacket {
    pub fn new(entitlement: i32, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        DataPacket {
            entitlement,
            content_type: content_type.into(),
            body,
        }
    }

    pub fn is_authorized(&self, entitlements: &HashSet<i32>) -> bool {
        self.entitlement == 0 || entitlements.contains(&self.entitlement)
    }

    fn encode(&self, buf: &mut FrameBuffer) {
        buf.put_i32(self.entitlement);
        buf.put_str(&self.content_type);
        buf.put_bytes(&self.body);
    }

    fn decode(buf: &mut FrameBuffer) -> Result<Self, ProtocolError> {
        Ok(DataPacket {
            entitlement: buf.get_i32()?,
            content_type: buf.get_string()?,
            body: buf.get_bytes()?,
        })
    }
}

fn encode_packets(packets: &[DataPacket], buf: &mut FrameBuffer) {
    buf.put_u32(packets.len() as u32);
    for packet in packets {
        packet.encode(buf);
    }
}

fn decode_packets(buf: &mut FrameBuffer) -> Result<Vec<DataPacket>, ProtocolError> {
    let count = buf.get_u32()?;
    let mut packets = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        packets.push(DataPacket::decode(buf)?);
    }
    Ok(packets)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationRequest {
    pub method: String,
    pub data: Vec<u8>,
}

/// Reserved for forward compatibility; round-trips but is never emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationResponse {
    pub client_id: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MulticastData {
    pub topic: String,
    pub data_packets: Vec<DataPacket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnicastData {
    pub client_id: String,
    pub topic: String,
    pub data_packets: Vec<DataPacket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedSubscriptionRequest {
    pub user: String,
    pub host: String,
    pub client_id: String,
    pub topic: String,
    pub is_add: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub pattern: String,
    pub is_add: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub is_add: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedMulticastData {
    pub user: String,
    pub host: String,
    pub feed: String,
    pub topic: String,
    pub content_type: String,
    pub data_packets: Vec<DataPacket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedUnicastData {
    pub user: String,
    pub host: String,
    pub client_id: String,
    pub feed: String,
    pub topic: String,
    pub content_type: String,
    pub data_packets: Vec<DataPacket>,
}

/// One variant per wire kind; dispatch is a match on the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    MulticastData(MulticastData),
    UnicastData(UnicastData),
    ForwardedSubscriptionRequest(ForwardedSubscriptionRequest),
    NotificationRequest(NotificationRequest),
    SubscriptionRequest(SubscriptionRequest),
    ForwardedMulticastData(ForwardedMulticastData),
    ForwardedUnicastData(ForwardedUnicastData),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AuthenticationRequest(_) => MessageKind::AuthenticationRequest,
            Message::AuthenticationResponse(_) => MessageKind::AuthenticationResponse,
            Message::MulticastData(_) => MessageKind::MulticastData,
            Message::UnicastData(_) => MessageKind::UnicastData,
            Message::ForwardedSubscriptionRequest(_) => MessageKind::ForwardedSubscriptionRequest,
            Message::NotificationRequest(_) => MessageKind::NotificationRequest,
            Message::SubscriptionRequest(_) => MessageKind::SubscriptionRequest,
            Message::ForwardedMulticastData(_) => MessageKind::ForwardedMulticastData,
            Message::ForwardedUnicastData(_) => MessageKind::ForwardedUnicastData,
        }
    }

    /// Serialize into a frame body: kind byte then the body fields in wire
    /// order.
    pub fn to_frame(&self) -> FrameBuffer {
        let mut buf = FrameBuffer::new();
        buf.put_u8(self.kind() as u8);
        match self {
            Message::AuthenticationRequest(m) => {
                buf.put_str(&m.method);
                buf.put_bytes(&m.data);
            }
            Message::AuthenticationResponse(m) => {
                buf.put_str(&m.client_id);
                buf.put_str(&m.user);
            }
            Message::MulticastData(m) => {
                buf.put_str(&m.topic);
                encode_packets(&m.data_packets, &mut buf);
            }
            Message::UnicastData(m) => {
                buf.put_str(&m.client_id);
                buf.put_str(&m.topic);
                encode_packets(&m.data_packets, &mut buf);
            }
            Message::ForwardedSubscriptionRequest(m) => {
                buf.put_str(&m.user);
                buf.put_str(&m.host);
                buf.put_str(&m.client_id);
                buf.put_str(&m.topic);
                buf.put_bool(m.is_add);
            }
            Message::NotificationRequest(m) => {
                buf.put_str(&m.pattern);
                buf.put_bool(m.is_add);
            }
            Message::SubscriptionRequest(m) => {
                buf.put_str(&m.topic);
                buf.put_bool(m.is_add);
            }
            Message::ForwardedMulticastData(m) => {
                buf.put_str(&m.user);
                buf.put_str(&m.host);
                buf.put_str(&m.feed);
                buf.put_str(&m.topic);
                buf.put_str(&m.content_type);
                encode_packets(&m.data_packets, &mut buf);
            }
            Message::ForwardedUnicastData(m) => {
                buf.put_str(&m.user);
                buf.put_str(&m.host);
                buf.put_str(&m.client_id);
                buf.put_str(&m.feed);
                buf.put_str(&m.topic);
                buf.put_str(&m.content_type);
                encode_packets(&m.data_packets, &mut buf);
            }
        }
        buf
    }

    pub fn decode(buf: &mut FrameBuffer) -> Result<Message, ProtocolError> {
        let kind = MessageKind::try_from(buf.get_u8()?)?;
        match kind {
            MessageKind::AuthenticationRequest => {
                Ok(Message::AuthenticationRequest(AuthenticationRequest {
                    method: buf.get_string()?,
                    data: buf.get_bytes()?,
                }))
            }
            MessageKind::AuthenticationResponse => {
                Ok(Message::AuthenticationResponse(AuthenticationResponse {
                    client_id: buf.get_string()?,
                    user: buf.get_string()?,
                }))
            }
            MessageKind::MulticastData => Ok(Message::MulticastData(MulticastData {
                topic: buf.get_string()?,
                data_packets: decode_packets(buf)?,
            })),
            MessageKind::UnicastData => Ok(Message::UnicastData(UnicastData {
                client_id: buf.get_string()?,
                topic: buf.get_string()?,
                data_packets: decode_packets(buf)?,
            })),
            MessageKind::ForwardedSubscriptionRequest => Ok(
                Message::ForwardedSubscriptionRequest(ForwardedSubscriptionRequest {
                    user: buf.get_string()?,
                    host: buf.get_string()?,
                    client_id: buf.get_string()?,
                    topic: buf.get_string()?,
                    is_add: buf.get_bool()?,
                }),
            ),
            MessageKind::NotificationRequest => {
                Ok(Message::NotificationRequest(NotificationRequest {
                    pattern: buf.get_string()?,
                    is_add: buf.get_bool()?,
                }))
            }
            MessageKind::SubscriptionRequest => {
                Ok(Message::SubscriptionRequest(SubscriptionRequest {
                    topic: buf.get_string()?,
                    is_add: buf.get_bool()?,
                }))
            }
            MessageKind::ForwardedMulticastData => {
                Ok(Message::ForwardedMulticastData(ForwardedMulticastData {
                    user: buf.get_string()?,
                    host: buf.get_string()?,
                    feed: buf.get_string()?,
                    topic: buf.get_string()?,
                    content_type: buf.get_string()?,
                    data_packets: decode_packets(buf)?,
                }))
            }
            MessageKind::ForwardedUnicastData => {
                Ok(Message::ForwardedUnicastData(ForwardedUnicastData {
                    user: buf.get_string()?,
                    host: buf.get_string()?,
                    client_id: buf.get_string()?,
                    feed: buf.get_string()?,
                    topic: buf.get_string()?,
                    content_type: buf.get_string()?,
                    data_packets: decode_packets(buf)?,
                }))
            }
        }
    }
}
