//! Miscellaneous common structs used throughout the library.

mod compact;
mod contact;
mod id;
pub mod messages;
mod routing_table;

pub use compact::*;
pub use contact::*;
pub use id::*;
pub use messages::{
    DecodeMessageError, Dict, ErrorSpecific, InboundQuery, Message, MessageType, Request, Response,
    ResponsePayload, Value,
};
pub use routing_table::*;
