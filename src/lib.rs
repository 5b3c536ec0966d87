#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod error;

pub mod rpc;

pub use crate::common::{
    messages, AddOutcome, AddressFamily, Contact, ContactCodec, Dict, Distance, ErrorSpecific,
    EvictionContest, EvictionVerdict, Id, InboundQuery, KBucket, Peer, Request, Response,
    ResponsePayload, RoutingTable, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use bytes::Bytes;
pub use error::Error;
pub use rpc::{Config, LookupError, QueryError, Rpc, RpcEvent};
