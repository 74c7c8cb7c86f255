//! RPC seam between a client and its server set.
//!
//! The protocol needs a plain request/response transport; everything on the
//! wire is byte arrays, serialized points, and round numbers already reduced
//! modulo the round window. [`ServerRpc`] is the seam, [`HttpServer`] the
//! JSON-over-HTTP implementation, and the in-memory mock in [`crate::mock`]
//! the test double.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Announcement sent once per client. `id` is `None` until the server set
/// assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub addr: String,
    /// Index of this client's home server in the ordered server list.
    pub home: usize,
    pub id: Option<u32>,
}

/// One half of a Diffie-Hellman exchange, tagged with the sending client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhShare {
    pub public: Vec<u8>,
    pub id: u32,
}

/// Length-M request vector: the real hash sits in one slot, zeros elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub hashes: Vec<Vec<u8>>,
    pub round: u64,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoundQuery {
    pub id: u32,
    pub round: u64,
}

/// An onion-encrypted block with its sealed digest and sealed opener point.
/// Carries no client id; uploads are anonymous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlock {
    pub hc1: Vec<Vec<u8>>,
    pub hc2: Vec<Vec<u8>>,
    pub dh1: Vec<u8>,
    pub dh2: Vec<u8>,
    pub body: Vec<u8>,
    pub round: u64,
}

/// Masked PIR retrieval: the home server XORs together the blocks at the
/// mask's set bits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PirQuery {
    pub mask: Vec<u8>,
    pub id: u32,
    pub round: u64,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server status {0}")]
    Status(u16),
    #[error("server error: {0}")]
    Server(String),
    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),
}

/// The calls a client issues against one server. Setup calls go to every
/// server; per-round calls only ever reach the home server.
#[async_trait]
pub trait ServerRpc: Send + Sync {
    async fn get_public_key(&self) -> Result<Vec<u8>, RpcError>;
    async fn register(&self, reg: &Registration) -> Result<u32, RpcError>;
    async fn num_clients(&self) -> Result<usize, RpcError>;
    async fn share_mask(&self, share: &DhShare) -> Result<Vec<u8>, RpcError>;
    async fn share_secret(&self, share: &DhShare) -> Result<Vec<u8>, RpcError>;
    async fn get_eph_key(&self) -> Result<Vec<u8>, RpcError>;
    async fn request_block(&self, req: &BlockRequest) -> Result<(), RpcError>;
    async fn get_request_hashes(&self, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError>;
    async fn upload_block(&self, block: &SealedBlock) -> Result<(), RpcError>;
    async fn get_upload_hashes(&self, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError>;
    async fn get_response(&self, query: &PirQuery) -> Result<Vec<u8>, RpcError>;
}

pub type ServerHandle = Arc<dyn ServerRpc>;

/// Network-backed server endpoint using HTTP posts with JSON bodies.
#[derive(Clone)]
pub struct HttpServer {
    url: String,
    client: reqwest::Client,
}

#[derive(Serialize, Deserialize)]
struct IdReply {
    id: u32,
}

#[derive(Serialize, Deserialize)]
struct CountReply {
    clients: usize,
}

#[derive(Serialize, Deserialize)]
struct PointReply {
    point: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct HashesReply {
    hashes: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct BlockReply {
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Ack {}

impl HttpServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }

    async fn post<Req, Reply>(&self, path: &str, body: &Req) -> Result<Reply, RpcError>
    where
        Req: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RpcError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| RpcError::Network(e.to_string()))
    }

    async fn get<Reply: DeserializeOwned>(&self, path: &str) -> Result<Reply, RpcError> {
        let response = self
            .client
            .get(self.endpoint(path))
            .send()
            .await
            .map_err(|e| RpcError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RpcError::Status(response.status().as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| RpcError::Network(e.to_string()))
    }
}

#[async_trait]
impl ServerRpc for HttpServer {
    async fn get_public_key(&self) -> Result<Vec<u8>, RpcError> {
        let reply: PointReply = self.get("public-key").await?;
        Ok(reply.point)
    }

    async fn register(&self, reg: &Registration) -> Result<u32, RpcError> {
        let reply: IdReply = self.post("register", reg).await?;
        Ok(reply.id)
    }

    async fn num_clients(&self) -> Result<usize, RpcError> {
        let reply: CountReply = self.get("num-clients").await?;
        Ok(reply.clients)
    }

    async fn share_mask(&self, share: &DhShare) -> Result<Vec<u8>, RpcError> {
        let reply: PointReply = self.post("share-mask", share).await?;
        Ok(reply.point)
    }

    async fn share_secret(&self, share: &DhShare) -> Result<Vec<u8>, RpcError> {
        let reply: PointReply = self.post("share-secret", share).await?;
        Ok(reply.point)
    }

    async fn get_eph_key(&self) -> Result<Vec<u8>, RpcError> {
        let reply: PointReply = self.get("eph-key").await?;
        Ok(reply.point)
    }

    async fn request_block(&self, req: &BlockRequest) -> Result<(), RpcError> {
        let _: Ack = self.post("request", req).await?;
        Ok(())
    }

    async fn get_request_hashes(&self, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError> {
        let reply: HashesReply = self.post("request-hashes", query).await?;
        Ok(reply.hashes)
    }

    async fn upload_block(&self, block: &SealedBlock) -> Result<(), RpcError> {
        let _: Ack = self.post("upload", block).await?;
        Ok(())
    }

    async fn get_upload_hashes(&self, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError> {
        let reply: HashesReply = self.post("upload-hashes", query).await?;
        Ok(reply.hashes)
    }

    async fn get_response(&self, query: &PirQuery) -> Result<Vec<u8>, RpcError> {
        let reply: BlockReply = self.post("response", query).await?;
        Ok(reply.data)
    }
}
