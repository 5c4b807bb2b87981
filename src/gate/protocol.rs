//! 网关帧格式：protobuf 编码的 `gatepb.Message`

use bytes::Bytes;
use prost::Message as _;
use thiserror::Error;

/// `gatepb.Meta`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Meta {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub method_name: String,
    #[prost(int32, tag = "3")]
    pub message_type: i32,
    #[prost(int64, tag = "4")]
    pub client_seq: i64,
    #[prost(int64, tag = "5")]
    pub server_seq: i64,
    #[prost(int64, tag = "6")]
    pub error_code: i64,
    #[prost(string, tag = "7")]
    pub error_message: String,
}

/// `gatepb.Message`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GateMessage {
    #[prost(message, optional, tag = "1")]
    pub meta: Option<Meta>,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

/// `gatepb.EventMessage`：推送帧的正文
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventMessage {
    #[prost(string, tag = "1")]
    pub message_type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 1,
    Reply = 2,
    Push = 3,
}

impl TryFrom<i32> for MessageType {
    type Error = FrameError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Push),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// 帧解码错误，只丢弃当前帧
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("Envelope has no meta")]
    MissingMeta,

    #[error("Unknown message_type {0}")]
    UnknownMessageType(i32),

    #[error("Negative sequence number {0}")]
    NegativeSeq(i64),
}

/// 解码后的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: String,
    pub method: String,
    pub kind: MessageType,
    pub client_seq: u64,
    pub server_seq: u64,
    pub error_code: i64,
    pub error_message: String,
    pub payload: Bytes,
}

impl Frame {
    /// 构造请求帧
    pub fn request(
        service: impl Into<String>,
        method: impl Into<String>,
        client_seq: u64,
        server_seq: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind: MessageType::Request,
            client_seq,
            server_seq,
            error_code: 0,
            error_message: String::new(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        GateMessage {
            meta: Some(Meta {
                service_name: self.service.clone(),
                method_name: self.method.clone(),
                message_type: self.kind as i32,
                client_seq: self.client_seq as i64,
                server_seq: self.server_seq as i64,
                error_code: self.error_code,
                error_message: self.error_message.clone(),
            }),
            body: self.payload.to_vec(),
        }
        .encode_to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let message = GateMessage::decode(buf)?;
        let meta = message.meta.ok_or(FrameError::MissingMeta)?;
        let kind = MessageType::try_from(meta.message_type)?;
        let client_seq = u64::try_from(meta.client_seq)
            .map_err(|_| FrameError::NegativeSeq(meta.client_seq))?;
        let server_seq = u64::try_from(meta.server_seq)
            .map_err(|_| FrameError::NegativeSeq(meta.server_seq))?;

        Ok(Self {
            service: meta.service_name,
            method: meta.method_name,
            kind,
            client_seq,
            server_seq,
            error_code: meta.error_code,
            error_message: meta.error_message,
            payload: Bytes::from(message.body),
        })
    }
}

/// 解码推送正文
pub fn decode_event(payload: &[u8]) -> Result<EventMessage, FrameError> {
    Ok(EventMessage::decode(payload)?)
}
