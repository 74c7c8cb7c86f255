//! Brume client: registration, request, upload, and masked-PIR download
//! against an anytrust server set.

pub mod client;
pub mod mock;
pub mod rpc;

pub use client::{Client, ClientError};
pub use mock::{MockDirectory, MockServer};
pub use rpc::{
    BlockRequest, DhShare, HttpServer, PirQuery, Registration, RoundQuery, RpcError, SealedBlock,
    ServerHandle, ServerRpc,
};
