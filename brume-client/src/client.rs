//! Per-client protocol state machine.
//!
//! One round has three independent sub-protocols: Request enqueues a wanted
//! hash and submits a padded request vector, Upload serves a hash some peer
//! demanded, Download retrieves the client's own wanted hash with a masked
//! PIR query. Each sub-protocol is single-flight behind its own lock and
//! advances its own round counter; the secret chains live behind the
//! download lock and step exactly once per download, in lock-step with the
//! home server. Nothing here retries: a failed call leaves the round
//! counters unusable, so errors propagate out and the process dies.

use std::sync::OnceLock;

use rand::rngs::OsRng;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use zeroize::Zeroizing;

use brume_core::chain::SecretChains;
use brume_core::config::ClientConfig;
use brume_core::error::Error as CoreError;
use brume_core::mask::xor_into;
use brume_core::seal::{multi_seal, seal_point};
use brume_core::store::{BlockStore, ContentHash};
use brume_core::suite::{Ristretto, Suite, DIGEST_LEN};
use futures::future::try_join_all;

use crate::rpc::{
    BlockRequest, DhShare, PirQuery, Registration, RoundQuery, RpcError, SealedBlock,
    ServerHandle,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),
    #[error("core: {0}")]
    Core(#[from] CoreError),
    #[error("not registered")]
    NotRegistered,
    #[error("already registered")]
    AlreadyRegistered,
    #[error("setup incomplete")]
    SetupIncomplete,
    #[error("{0} called twice")]
    SetupRepeated(&'static str),
    #[error("server index {0} out of range")]
    ServerIndex(usize),
    #[error("{clients} clients exceed the {capacity}-slot mask capacity")]
    TooManyClients { clients: usize, capacity: usize },
    #[error("slot {slot} out of range for {clients} clients")]
    SlotOutOfRange { slot: usize, clients: usize },
    #[error("request queue closed")]
    QueueClosed,
    #[error("response was {actual} bytes, blocks are {expected}")]
    BadResponseLength { expected: usize, actual: usize },
}

struct RequestLane {
    round: u64,
    queue: mpsc::Sender<ContentHash>,
}

struct DownloadLane<S: Suite> {
    round: u64,
    queue: mpsc::Receiver<ContentHash>,
    chains: Option<SecretChains<S>>,
}

pub struct Client<S: Suite = Ristretto> {
    config: ClientConfig,
    home: usize,
    servers: Vec<ServerHandle>,
    pks: Vec<S::Point>,
    store: BlockStore<S>,
    id: OnceLock<u32>,
    total_clients: OnceLock<usize>,
    eph_keys: OnceLock<Vec<S::Point>>,
    request: Mutex<RequestLane>,
    request_hashes: Mutex<u64>,
    upload: Mutex<u64>,
    download: Mutex<DownloadLane<S>>,
}

impl<S: Suite> Client<S> {
    /// Validate the configuration and fetch every server's long-term public
    /// key. `servers` must parallel `config.servers`.
    pub async fn connect(
        config: ClientConfig,
        servers: Vec<ServerHandle>,
        store: BlockStore<S>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        if servers.len() != config.servers.len() {
            return Err(CoreError::InvalidConfig(format!(
                "{} handles for {} configured servers",
                servers.len(),
                config.servers.len()
            ))
            .into());
        }
        let home = config
            .home_index()
            .ok_or_else(|| CoreError::InvalidConfig("home server not in list".into()))?;
        let raw = try_join_all(servers.iter().map(|s| s.get_public_key())).await?;
        let pks = raw
            .iter()
            .map(|bytes| S::unmarshal(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(servers = servers.len(), "fetched server public keys");
        let (queue_tx, queue_rx) = mpsc::channel(config.max_rounds);
        Ok(Self {
            config,
            home,
            servers,
            pks,
            store,
            id: OnceLock::new(),
            total_clients: OnceLock::new(),
            eph_keys: OnceLock::new(),
            request: Mutex::new(RequestLane {
                round: 0,
                queue: queue_tx,
            }),
            request_hashes: Mutex::new(0),
            upload: Mutex::new(0),
            download: Mutex::new(DownloadLane {
                round: 0,
                queue: queue_rx,
                chains: None,
            }),
        })
    }

    /// Announce this client via server `via` and store the assigned id.
    pub async fn register(&self, via: usize) -> Result<u32, ClientError> {
        let server = self.servers.get(via).ok_or(ClientError::ServerIndex(via))?;
        let reg = Registration {
            addr: self.config.addr.clone(),
            home: self.home,
            id: None,
        };
        let id = server.register(&reg).await?;
        self.id
            .set(id)
            .map_err(|_| ClientError::AlreadyRegistered)?;
        info!(id, "registered with server set");
        Ok(id)
    }

    /// Fetch the final client count once every client has registered (an
    /// external barrier guarantees that). Checks the count fits the S-byte
    /// PIR mask.
    pub async fn register_done(&self) -> Result<usize, ClientError> {
        let id = self.require_id()?;
        let clients = self.home_server().num_clients().await?;
        let capacity = S::POINT_LEN * 8;
        if clients == 0 || clients > capacity {
            return Err(ClientError::TooManyClients { clients, capacity });
        }
        if id as usize >= clients {
            return Err(RpcError::InvalidResponse("assigned id outside client range").into());
        }
        self.total_clients
            .set(clients)
            .map_err(|_| ClientError::SetupRepeated("register_done"))?;
        info!(clients, "registration complete");
        Ok(clients)
    }

    /// Run the one-shot Diffie-Hellman with every server: two fresh scalars,
    /// three concurrent calls per server (mask share, secret share,
    /// ephemeral key). Each per-server trio joins before that server's slot
    /// is seeded; a single failure aborts the whole setup.
    pub async fn share_secrets(&self) -> Result<(), ClientError> {
        let id = self.require_id()?;
        if self.eph_keys.get().is_some() {
            return Err(ClientError::SetupRepeated("share_secrets"));
        }
        let s1 = Zeroizing::new(S::random_scalar(&mut OsRng));
        let s2 = Zeroizing::new(S::random_scalar(&mut OsRng));
        let p1 = S::marshal(&S::mul_base(&s1));
        let p2 = S::marshal(&S::mul_base(&s2));

        let joined = try_join_all(self.servers.iter().map(|server| {
            let mask_share = DhShare {
                public: p1.clone(),
                id,
            };
            let secret_share = DhShare {
                public: p2.clone(),
                id,
            };
            async move {
                tokio::try_join!(
                    server.share_mask(&mask_share),
                    server.share_secret(&secret_share),
                    server.get_eph_key(),
                )
            }
        }))
        .await?;

        let mut masks = Vec::with_capacity(joined.len());
        let mut secrets = Vec::with_capacity(joined.len());
        let mut eph_keys = Vec::with_capacity(joined.len());
        for (q1, q2, eph) in joined {
            let q1 = S::unmarshal(&q1)?;
            let q2 = S::unmarshal(&q2)?;
            masks.push(S::marshal(&S::mul(&q1, &s1)));
            secrets.push(S::marshal(&S::mul(&q2, &s2)));
            eph_keys.push(S::unmarshal(&eph)?);
        }
        let chains = SecretChains::from_seeds(masks, secrets)?;
        {
            let mut lane = self.download.lock().await;
            if lane.chains.is_some() {
                return Err(ClientError::SetupRepeated("share_secrets"));
            }
            lane.chains = Some(chains);
        }
        self.eph_keys
            .set(eph_keys)
            .map_err(|_| ClientError::SetupRepeated("share_secrets"))?;
        info!("per-server secrets established");
        Ok(())
    }

    /// Ask for the block whose content hash is `hash`, occupying `slot` of
    /// the round's request vector. Enqueues the hash for a later
    /// [`Client::download`] before anything touches the wire; a full queue
    /// blocks until a download drains it.
    pub async fn request_block(&self, slot: usize, hash: ContentHash) -> Result<(), ClientError> {
        let id = self.require_id()?;
        let clients = self.require_total()?;
        if slot >= clients {
            return Err(ClientError::SlotOutOfRange { slot, clients });
        }
        let mut lane = self.request.lock().await;
        let mut hashes = vec![vec![0u8; DIGEST_LEN]; clients];
        hashes[slot] = hash.to_vec();
        lane.queue
            .send(hash)
            .await
            .map_err(|_| ClientError::QueueClosed)?;
        let req = BlockRequest {
            hashes,
            round: lane.round % self.window(),
            id,
        };
        self.home_server().request_block(&req).await?;
        lane.round += 1;
        debug!(round = lane.round, slot, "request submitted");
        Ok(())
    }

    /// The round's requested-hash vector, under its own lock and counter:
    /// request and upload run one round apart in the pipeline.
    async fn fetch_request_hashes(&self) -> Result<Vec<ContentHash>, ClientError> {
        let id = self.require_id()?;
        let clients = self.require_total()?;
        let mut round = self.request_hashes.lock().await;
        let query = RoundQuery {
            id,
            round: *round % self.window(),
        };
        let raw = self.home_server().get_request_hashes(&query).await?;
        if raw.len() != clients {
            return Err(RpcError::InvalidResponse("request vector length mismatch").into());
        }
        let mut hashes = Vec::with_capacity(raw.len());
        for h in raw {
            let hash: ContentHash = h
                .as_slice()
                .try_into()
                .map_err(|_| RpcError::InvalidResponse("request hash is not digest sized"))?;
            hashes.push(hash);
        }
        *round += 1;
        Ok(hashes)
    }

    /// Serve the round: fetch the requested hashes, find a matching local
    /// block (a zero block if nothing matches), onion-encrypt it for the
    /// server chain, and submit it with its sealed digest and sealed opener.
    pub async fn upload(&self) -> Result<(), ClientError> {
        let eph_keys = self.eph_keys.get().ok_or(ClientError::SetupIncomplete)?;
        let mut round = self.upload.lock().await;
        let wanted = self.fetch_request_hashes().await?;

        let location = self.store.find(&wanted);
        let mut body = match &location {
            Some(loc) => self.store.read_block(loc)?,
            None => vec![0u8; self.config.block_size],
        };

        let digest = S::hash(&body);
        let sealed = multi_seal::<S, _>(&self.pks, &digest, &mut OsRng);
        let r = Zeroizing::new(S::random_scalar(&mut OsRng));
        let opener = S::mul_base(&r);
        let (dh1, dh2) = seal_point::<S, _>(&self.pks[0], &opener, &mut OsRng);
        for eph in eph_keys {
            let key = S::marshal(&S::mul(eph, &r));
            S::keystream_xor(&key, &mut body)?;
        }

        let block = SealedBlock {
            hc1: sealed.shares.iter().map(|p| S::marshal(p)).collect(),
            hc2: sealed.blinded.iter().map(|c| c.to_vec()).collect(),
            dh1: S::marshal(&dh1),
            dh2: S::marshal(&dh2),
            body,
            round: *round % self.window(),
        };
        self.home_server().upload_block(&block).await?;
        *round += 1;
        debug!(
            round = *round,
            matched = location.is_some(),
            "block uploaded"
        );
        Ok(())
    }

    /// Retrieve the oldest hash this client requested. Returns the recovered
    /// block, or empty bytes when no peer uploaded the hash this round (an
    /// anonymous miss). The secret chains and the download round advance in
    /// either case; only a transport or length failure leaves them untouched
    /// (and the client unusable).
    pub async fn download(&self) -> Result<Vec<u8>, ClientError> {
        let id = self.require_id()?;
        let mut lane = self.download.lock().await;
        let hash = lane.queue.recv().await.ok_or(ClientError::QueueClosed)?;
        let wire_round = lane.round % self.window();
        let query = RoundQuery {
            id,
            round: wire_round,
        };
        let uploaded = self.home_server().get_upload_hashes(&query).await?;
        let slot = uploaded.iter().position(|h| h.as_slice() == hash.as_slice());
        let chains = lane.chains.as_mut().ok_or(ClientError::SetupIncomplete)?;

        let block = match slot {
            Some(slot) => {
                let mask = chains.pir_query(self.home, slot)?;
                let pir = PirQuery {
                    mask,
                    id,
                    round: wire_round,
                };
                let mut data = self.servers[self.home].get_response(&pir).await?;
                if data.len() != self.config.block_size {
                    return Err(ClientError::BadResponseLength {
                        expected: self.config.block_size,
                        actual: data.len(),
                    });
                }
                xor_into(&mut data, &chains.pad(self.config.block_size)?)?;
                debug!(round = wire_round, slot, "block recovered");
                data
            }
            None => {
                debug!(round = wire_round, "requested hash absent this round");
                Vec::new()
            }
        };

        chains.advance()?;
        lane.round += 1;
        Ok(block)
    }

    pub fn id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    pub fn total_clients(&self) -> Option<usize> {
        self.total_clients.get().copied()
    }

    pub fn home_index(&self) -> usize {
        self.home
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Current chain states, (masks, secrets). For lock-step assertions in
    /// tests; `None` before setup.
    pub async fn chain_snapshot(&self) -> Option<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let lane = self.download.lock().await;
        lane.chains
            .as_ref()
            .map(|c| (c.masks().to_vec(), c.secrets().to_vec()))
    }

    fn home_server(&self) -> &ServerHandle {
        &self.servers[self.home]
    }

    fn window(&self) -> u64 {
        self.config.max_rounds as u64
    }

    fn require_id(&self) -> Result<u32, ClientError> {
        self.id.get().copied().ok_or(ClientError::NotRegistered)
    }

    fn require_total(&self) -> Result<usize, ClientError> {
        self.total_clients
            .get()
            .copied()
            .ok_or(ClientError::SetupIncomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDirectory;
    use std::sync::Arc;

    fn config(servers: &[&str]) -> ClientConfig {
        let mut cfg = ClientConfig::new(
            "127.0.0.1:9000",
            servers.iter().map(|s| s.to_string()).collect(),
            servers[0],
        );
        cfg.block_size = 64;
        cfg
    }

    async fn connected(directory: &Arc<MockDirectory>) -> Client {
        let store = BlockStore::new(64).expect("store");
        Client::connect(config(&["s0", "s1", "s2"]), directory.handles(), store)
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn round_calls_require_registration() {
        let directory = Arc::new(MockDirectory::new(3, 64));
        let client = connected(&directory).await;
        assert!(matches!(
            client.request_block(0, [0u8; 32]).await,
            Err(ClientError::NotRegistered)
        ));
        assert!(matches!(
            client.upload().await,
            Err(ClientError::SetupIncomplete)
        ));
    }

    #[tokio::test]
    async fn register_twice_is_an_error() {
        let directory = Arc::new(MockDirectory::new(3, 64));
        let client = connected(&directory).await;
        client.register(0).await.expect("first registration");
        assert!(matches!(
            client.register(1).await,
            Err(ClientError::AlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn request_slot_must_fit_the_client_set() {
        let directory = Arc::new(MockDirectory::new(3, 64));
        let client = connected(&directory).await;
        client.register(0).await.expect("register");
        client.register_done().await.expect("done");
        assert!(matches!(
            client.request_block(5, [0u8; 32]).await,
            Err(ClientError::SlotOutOfRange { slot: 5, clients: 1 })
        ));
    }

    #[tokio::test]
    async fn setup_must_run_before_download() {
        let directory = Arc::new(MockDirectory::new(3, 64));
        let client = connected(&directory).await;
        client.register(0).await.expect("register");
        client.register_done().await.expect("done");
        client.request_block(0, [7u8; 32]).await.expect("request");
        assert!(matches!(
            client.download().await,
            Err(ClientError::SetupIncomplete)
        ));
    }
}
