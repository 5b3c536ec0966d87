//! Krpc payloads exchanged between this node and the [Transport](crate::rpc::Transport).
//!
//! Lookups are generic over the query they send (`find_node`, `get_peers`, ...), so
//! arguments and return values are kept as bencode dictionaries, with typed accessors
//! for the few keys this crate cares about (`id`, `token`, `nodes`).

mod internal;

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{Contact, Id};

pub use serde_bencode::value::Value;

#[derive(Debug, Clone, Default, PartialEq)]
/// A bencode dictionary, the `a` of a request or the `r` of a response.
pub struct Dict(HashMap<Vec<u8>, Value>);

impl Dict {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key.as_bytes())
    }

    /// Returns the value of `key` if it is a byte string.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Value::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the value of `key` if it is an integer.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(int)) => Some(*int),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key.as_bytes())
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.0.insert(key.as_bytes().to_vec(), value)
    }

    pub fn insert_bytes<T: AsRef<[u8]>>(&mut self, key: &str, bytes: T) -> Option<Value> {
        self.insert(key, Value::Bytes(bytes.as_ref().to_vec()))
    }

    pub fn insert_int(&mut self, key: &str, int: i64) -> Option<Value> {
        self.insert(key, Value::Int(int))
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> HashMap<Vec<u8>, Value> {
        self.0
    }
}

impl From<HashMap<Vec<u8>, Value>> for Dict {
    fn from(map: HashMap<Vec<u8>, Value>) -> Self {
        Self(map)
    }
}

impl From<Dict> for Value {
    fn from(dict: Dict) -> Self {
        Value::Dict(dict.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// An outbound query, also used as the message template of lookups.
pub struct Request {
    /// The `q` field, for example `find_node` or `get_peers`.
    pub method: String,
    /// The `a` field.
    pub arguments: Dict,
}

impl Request {
    pub fn new<T: Into<String>>(method: T, arguments: Dict) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    /// A `find_node` query for `target`.
    pub fn find_node(target: &Id) -> Self {
        let mut arguments = Dict::new();
        arguments.insert_bytes("target", target);

        Self::new("find_node", arguments)
    }

    /// The `id` argument, if present.
    pub fn requester_id(&self) -> Option<&[u8]> {
        self.arguments.get_bytes("id")
    }

    /// Set the `id` argument unless the caller already did.
    pub(crate) fn stamp_id(&mut self, id: &Id) {
        if !self.arguments.contains_key("id") {
            self.arguments.insert_bytes("id", id);
        }
    }

    pub(crate) fn set_token(&mut self, token: &Bytes) {
        self.arguments.insert_bytes("token", token);
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
/// A successful reply to a query, the `r` field of a response message.
pub struct Response {
    pub values: Dict,
}

impl Response {
    pub fn new(values: Dict) -> Self {
        Self { values }
    }

    /// The responder's id, as claimed in the response.
    pub fn responder_id(&self) -> Option<&[u8]> {
        self.values.get_bytes("id")
    }

    /// The compact IPv4 contact list, if any.
    pub fn nodes(&self) -> Option<&[u8]> {
        self.values.get_bytes("nodes")
    }

    /// The compact IPv6 contact list, if any.
    pub fn nodes6(&self) -> Option<&[u8]> {
        self.values.get_bytes("nodes6")
    }

    pub fn token(&self) -> Option<&[u8]> {
        self.values.get_bytes("token")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The `e` field of an error message.
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl std::fmt::Display for ErrorSpecific {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.description)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A query received from another node.
pub struct InboundQuery {
    pub transaction_id: Bytes,
    pub from: SocketAddr,
    pub request: Request,
}

impl InboundQuery {
    /// The `id` argument of the query, if present.
    pub fn requester_id(&self) -> Option<&[u8]> {
        self.request.requester_id()
    }
}

#[derive(Debug, Clone, Default)]
/// Reply to an [InboundQuery], see [Rpc::response](crate::rpc::Rpc::response).
pub struct ResponsePayload {
    /// Return values; `id` is filled in with this node's id when missing.
    pub values: Dict,
    /// Contacts to encode in the `nodes` (IPv4) and `nodes6` (IPv6) fields.
    pub nodes: Option<Vec<Contact>>,
}

impl ResponsePayload {
    pub fn new(values: Dict) -> Self {
        Self {
            values,
            nodes: None,
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<Contact>) -> Self {
        self.nodes = Some(nodes);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A Krpc message as sent over the wire.
pub struct Message {
    pub transaction_id: Bytes,

    /// The version of the requester or responder.
    pub version: Option<Bytes>,

    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    Request(Request),

    Response(Response),

    Error(ErrorSpecific),
}

#[derive(thiserror::Error, Debug)]
/// Failure to encode or decode a Krpc message.
pub enum DecodeMessageError {
    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field: {0}")]
    InvalidField(&'static str),

    #[error("Unknown message type: {0:?}")]
    UnknownMessageType(Vec<u8>),
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, DecodeMessageError> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeMessageError> {
        Message::from_serde_message(internal::KrpcMessage::from_bytes(bytes.as_ref())?)
    }

    fn into_serde_message(self) -> internal::KrpcMessage {
        let mut message = internal::KrpcMessage {
            transaction_id: ByteBuf::from(self.transaction_id.to_vec()),
            message_type: ByteBuf::new(),
            method: None,
            arguments: None,
            response: None,
            error: None,
            version: self.version.map(|version| ByteBuf::from(version.to_vec())),
        };

        match self.message_type {
            MessageType::Request(Request { method, arguments }) => {
                message.message_type = ByteBuf::from(b"q".to_vec());
                message.method = Some(ByteBuf::from(method.into_bytes()));
                message.arguments = Some(arguments.into());
            }
            MessageType::Response(Response { values }) => {
                message.message_type = ByteBuf::from(b"r".to_vec());
                message.response = Some(values.into());
            }
            MessageType::Error(ErrorSpecific { code, description }) => {
                message.message_type = ByteBuf::from(b"e".to_vec());
                message.error = Some(Value::List(vec![
                    Value::Int(code as i64),
                    Value::Bytes(description.into_bytes()),
                ]));
            }
        }

        message
    }

    fn from_serde_message(message: internal::KrpcMessage) -> Result<Message, DecodeMessageError> {
        let message_type = match message.message_type.as_slice() {
            b"q" => {
                let method = message
                    .method
                    .ok_or(DecodeMessageError::MissingField("q"))?;

                MessageType::Request(Request {
                    method: String::from_utf8_lossy(&method).to_string(),
                    arguments: into_dict(message.arguments, "a")?,
                })
            }
            b"r" => MessageType::Response(Response {
                values: into_dict(message.response, "r")?,
            }),
            b"e" => match message.error {
                Some(Value::List(list)) => match list.as_slice() {
                    [Value::Int(code), Value::Bytes(description), ..] => {
                        MessageType::Error(ErrorSpecific {
                            code: i32::try_from(*code)
                                .map_err(|_| DecodeMessageError::InvalidField("e"))?,
                            description: String::from_utf8_lossy(description).to_string(),
                        })
                    }
                    _ => return Err(DecodeMessageError::InvalidField("e")),
                },
                Some(_) => return Err(DecodeMessageError::InvalidField("e")),
                None => return Err(DecodeMessageError::MissingField("e")),
            },
            other => return Err(DecodeMessageError::UnknownMessageType(other.to_vec())),
        };

        Ok(Message {
            transaction_id: Bytes::from(message.transaction_id.into_vec()),
            version: message
                .version
                .map(|version| Bytes::from(version.into_vec())),
            message_type,
        })
    }
}

fn into_dict(value: Option<Value>, field: &'static str) -> Result<Dict, DecodeMessageError> {
    match value {
        Some(Value::Dict(map)) => Ok(Dict::from(map)),
        Some(_) => Err(DecodeMessageError::InvalidField(field)),
        None => Err(DecodeMessageError::MissingField(field)),
    }
}
