use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KrpcMessage {
    #[serde(rename = "t")]
    pub transaction_id: ByteBuf,

    #[serde(rename = "y")]
    pub message_type: ByteBuf,

    #[serde(default, rename = "q", skip_serializing_if = "Option::is_none")]
    pub method: Option<ByteBuf>,

    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,
}

impl KrpcMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<KrpcMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
