//! In-memory honest server set for deterministic tests.
//!
//! One [`MockDirectory`] plays every server in the anytrust set: it assigns
//! client ids, answers the setup Diffie-Hellman exchanges, mirrors each
//! client's secret chains, peels the upload onion, opens the sealed digests,
//! combines request vectors, and answers PIR queries exactly as honest
//! servers would, advancing its chain mirrors after every response.
//! [`MockServer`] is the per-server facade handed to a client.
//!
//! Wire rounds are taken at face value, so a test run must stay inside the
//! configured round window (configure a window at least as long as the run).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::OsRng;

use brume_core::chain::SecretChains;
use brume_core::mask::{get_bit, xor_into};
use brume_core::seal::{open, open_point};
use brume_core::suite::{Ristretto, Suite, DIGEST_LEN};

use crate::rpc::{
    BlockRequest, DhShare, PirQuery, Registration, RoundQuery, RpcError, SealedBlock, ServerHandle,
    ServerRpc,
};

pub struct MockDirectory<S: Suite = Ristretto> {
    block_size: usize,
    state: Mutex<DirectoryState<S>>,
}

struct DirectoryState<S: Suite> {
    servers: Vec<ServerKeys<S>>,
    clients: Vec<ClientRecord<S>>,
    requests: HashMap<u64, Vec<Vec<u8>>>,
    uploads: HashMap<u64, Vec<UploadRecord>>,
    last_request: Option<BlockRequest>,
    log: HashMap<(&'static str, Option<u32>), Vec<u64>>,
}

struct ServerKeys<S: Suite> {
    sk: S::Scalar,
    pk: S::Point,
    eph_sk: S::Scalar,
    eph_pk: S::Point,
}

struct ClientRecord<S: Suite> {
    #[allow(dead_code)]
    addr: String,
    home: usize,
    mask_seeds: Vec<Option<Vec<u8>>>,
    secret_seeds: Vec<Option<Vec<u8>>>,
    chains: Option<SecretChains<S>>,
    /// Download rounds this client's chain mirror has been advanced through.
    /// Real servers advance once per round whether or not the client's query
    /// arrives (a miss never reaches the server), so the mirror catches up
    /// to the queried round before answering.
    chain_round: u64,
}

struct UploadRecord {
    digest: Vec<u8>,
    body: Vec<u8>,
}

fn violation(msg: impl Into<String>) -> RpcError {
    RpcError::Server(msg.into())
}

impl<S: Suite> MockDirectory<S> {
    pub fn new(servers: usize, block_size: usize) -> Self {
        let servers = (0..servers)
            .map(|_| {
                let sk = S::random_scalar(&mut OsRng);
                let eph_sk = S::random_scalar(&mut OsRng);
                ServerKeys {
                    pk: S::mul_base(&sk),
                    eph_pk: S::mul_base(&eph_sk),
                    sk,
                    eph_sk,
                }
            })
            .collect();
        Self {
            block_size,
            state: Mutex::new(DirectoryState {
                servers,
                clients: Vec::new(),
                requests: HashMap::new(),
                uploads: HashMap::new(),
                last_request: None,
                log: HashMap::new(),
            }),
        }
    }

    /// One [`ServerHandle`] per server in the set, in server order.
    pub fn handles(self: &Arc<Self>) -> Vec<ServerHandle> {
        let count = self.lock().servers.len();
        (0..count)
            .map(|index| {
                Arc::new(MockServer {
                    directory: self.clone(),
                    index,
                }) as ServerHandle
            })
            .collect()
    }

    /// The most recent request vector, as received on the wire.
    pub fn last_request(&self) -> Option<BlockRequest> {
        self.lock().last_request.clone()
    }

    /// Rounds observed on `endpoint`, in arrival order. Uploads carry no
    /// client id and are logged under `None`.
    pub fn rounds_seen(&self, endpoint: &'static str, id: Option<u32>) -> Vec<u64> {
        self.lock().log.get(&(endpoint, id)).cloned().unwrap_or_default()
    }

    /// Server-side mirror of a client's chains: (masks, secrets).
    pub fn chain_mirror(&self, id: u32) -> Option<(Vec<Vec<u8>>, Vec<Vec<u8>>)> {
        let state = self.lock();
        let record = state.clients.get(id as usize)?;
        let chains = record.chains.as_ref()?;
        Some((chains.masks().to_vec(), chains.secrets().to_vec()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState<S>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_public_key(&self, index: usize) -> Result<Vec<u8>, RpcError> {
        let state = self.lock();
        Ok(S::marshal(&state.servers[index].pk))
    }

    fn register(&self, _index: usize, reg: &Registration) -> Result<u32, RpcError> {
        let mut state = self.lock();
        if reg.id.is_some() {
            return Err(violation("client already holds an id"));
        }
        if reg.home >= state.servers.len() {
            return Err(violation(format!("home index {} out of range", reg.home)));
        }
        let id = state.clients.len() as u32;
        let servers = state.servers.len();
        state.clients.push(ClientRecord {
            addr: reg.addr.clone(),
            home: reg.home,
            mask_seeds: vec![None; servers],
            secret_seeds: vec![None; servers],
            chains: None,
            chain_round: 0,
        });
        Ok(id)
    }

    fn num_clients(&self) -> Result<usize, RpcError> {
        Ok(self.lock().clients.len())
    }

    fn share(&self, index: usize, share: &DhShare, mask: bool) -> Result<Vec<u8>, RpcError> {
        let mut state = self.lock();
        let public = S::unmarshal(&share.public)
            .map_err(|_| violation("unmarshalable dh share"))?;
        let responder = S::random_scalar(&mut OsRng);
        let seed = S::marshal(&S::mul(&public, &responder));
        let reply = S::marshal(&S::mul_base(&responder));
        let record = state
            .clients
            .get_mut(share.id as usize)
            .ok_or_else(|| violation(format!("unknown client {}", share.id)))?;
        let slot = if mask {
            &mut record.mask_seeds[index]
        } else {
            &mut record.secret_seeds[index]
        };
        if slot.is_some() {
            return Err(violation("dh share repeated"));
        }
        *slot = Some(seed);
        if record.mask_seeds.iter().all(Option::is_some)
            && record.secret_seeds.iter().all(Option::is_some)
        {
            let masks = record.mask_seeds.iter().flatten().cloned().collect();
            let secrets = record.secret_seeds.iter().flatten().cloned().collect();
            record.chains = Some(
                SecretChains::from_seeds(masks, secrets)
                    .map_err(|e| violation(e.to_string()))?,
            );
        }
        Ok(reply)
    }

    fn get_eph_key(&self, index: usize) -> Result<Vec<u8>, RpcError> {
        let state = self.lock();
        Ok(S::marshal(&state.servers[index].eph_pk))
    }

    fn request_block(&self, index: usize, req: &BlockRequest) -> Result<(), RpcError> {
        let mut state = self.lock();
        let clients = state.clients.len();
        let record = state
            .clients
            .get(req.id as usize)
            .ok_or_else(|| violation(format!("unknown client {}", req.id)))?;
        if index != record.home {
            return Err(violation("request sent to a non-home server"));
        }
        if req.hashes.len() != clients {
            return Err(violation(format!(
                "request vector holds {} slots for {} clients",
                req.hashes.len(),
                clients
            )));
        }
        if req.hashes.iter().any(|h| h.len() != DIGEST_LEN) {
            return Err(violation("request hash is not digest sized"));
        }
        let combined = state
            .requests
            .entry(req.round)
            .or_insert_with(|| vec![vec![0u8; DIGEST_LEN]; clients]);
        for (slot, hash) in combined.iter_mut().zip(req.hashes.iter()) {
            xor_into(slot, hash).map_err(|e| violation(e.to_string()))?;
        }
        state.last_request = Some(req.clone());
        let id = req.id;
        let round = req.round;
        state.log.entry(("request", Some(id))).or_default().push(round);
        Ok(())
    }

    fn get_request_hashes(&self, index: usize, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError> {
        let mut state = self.lock();
        let clients = state.clients.len();
        let record = state
            .clients
            .get(query.id as usize)
            .ok_or_else(|| violation(format!("unknown client {}", query.id)))?;
        if index != record.home {
            return Err(violation("round call sent to a non-home server"));
        }
        let hashes = state
            .requests
            .get(&query.round)
            .cloned()
            .unwrap_or_else(|| vec![vec![0u8; DIGEST_LEN]; clients]);
        state
            .log
            .entry(("request-hashes", Some(query.id)))
            .or_default()
            .push(query.round);
        Ok(hashes)
    }

    fn upload_block(&self, _index: usize, block: &SealedBlock) -> Result<(), RpcError> {
        let mut state = self.lock();
        let DirectoryState {
            servers,
            clients,
            uploads,
            log,
            ..
        } = &mut *state;
        let n = servers.len();
        if block.body.len() != self.block_size {
            return Err(violation(format!(
                "uploaded body is {} bytes, blocks are {}",
                block.body.len(),
                self.block_size
            )));
        }
        if block.hc1.len() != n || block.hc2.len() != n {
            return Err(violation("sealed digest arrays do not cover the server set"));
        }

        // Server 0 opens the onion key point; each layer then peels with its
        // own ephemeral secret, in reverse order of application.
        let dh1 = S::unmarshal(&block.dh1).map_err(|_| violation("unmarshalable opener"))?;
        let dh2 = S::unmarshal(&block.dh2).map_err(|_| violation("unmarshalable opener"))?;
        let opener = open_point::<S>(&servers[0].sk, &dh1, &dh2);
        let mut body = block.body.clone();
        for keys in servers.iter().rev() {
            let key = S::marshal(&S::mul(&opener, &keys.eph_sk));
            S::keystream_xor(&key, &mut body).map_err(|e| violation(e.to_string()))?;
        }

        // Anonymity audit: every server recovers the same digest, and it
        // matches the block it sealed.
        let mut digest = None;
        for (keys, (c1, c2)) in servers.iter().zip(block.hc1.iter().zip(block.hc2.iter())) {
            let share = S::unmarshal(c1).map_err(|_| violation("unmarshalable sealed digest"))?;
            let blinded: [u8; DIGEST_LEN] = c2
                .as_slice()
                .try_into()
                .map_err(|_| violation("sealed digest is not digest sized"))?;
            let opened = open::<S>(&keys.sk, &share, &blinded);
            match digest {
                None => digest = Some(opened),
                Some(prev) if prev == opened => {}
                Some(_) => return Err(violation("sealed digests disagree across servers")),
            }
        }
        let digest = digest.ok_or_else(|| violation("empty server set"))?;
        if digest != S::hash(&body) {
            return Err(violation("sealed digest does not match the uploaded block"));
        }

        let slots = uploads.entry(block.round).or_default();
        if slots.len() >= clients.len() {
            return Err(violation("more uploads than clients this round"));
        }
        slots.push(UploadRecord {
            digest: digest.to_vec(),
            body,
        });
        log.entry(("upload", None)).or_default().push(block.round);
        Ok(())
    }

    fn get_upload_hashes(&self, index: usize, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError> {
        let mut state = self.lock();
        let clients = state.clients.len();
        let record = state
            .clients
            .get(query.id as usize)
            .ok_or_else(|| violation(format!("unknown client {}", query.id)))?;
        if index != record.home {
            return Err(violation("round call sent to a non-home server"));
        }
        let mut hashes: Vec<Vec<u8>> = state
            .uploads
            .get(&query.round)
            .map(|slots| slots.iter().map(|u| u.digest.clone()).collect())
            .unwrap_or_default();
        hashes.resize(clients, vec![0u8; DIGEST_LEN]);
        state
            .log
            .entry(("upload-hashes", Some(query.id)))
            .or_default()
            .push(query.round);
        Ok(hashes)
    }

    fn get_response(&self, index: usize, query: &PirQuery) -> Result<Vec<u8>, RpcError> {
        let mut state = self.lock();
        let DirectoryState {
            servers,
            clients,
            uploads,
            log,
            ..
        } = &mut *state;
        let total = clients.len();
        let record = clients
            .get_mut(query.id as usize)
            .ok_or_else(|| violation(format!("unknown client {}", query.id)))?;
        if index != record.home {
            return Err(violation("pir query sent to a non-home server"));
        }
        if query.mask.len() != S::POINT_LEN {
            return Err(violation("pir mask is not state sized"));
        }
        if query.round < record.chain_round {
            return Err(violation("pir round replay"));
        }
        let catch_up = query.round - record.chain_round;
        let chains = record
            .chains
            .as_mut()
            .ok_or_else(|| violation("pir query before key setup"))?;
        for _ in 0..catch_up {
            chains.advance().map_err(|e| violation(e.to_string()))?;
        }
        let empty = Vec::new();
        let slots = uploads.get(&query.round).unwrap_or(&empty);

        // Every server folds in the blocks its mask selects plus its secret
        // pad; the home server uses the client-supplied mask instead of its
        // chain mask. Absent slots are zero blocks and drop out of the XOR.
        let mut response = vec![0u8; self.block_size];
        for i in 0..servers.len() {
            let selector: &[u8] = if i == record.home {
                &query.mask
            } else {
                &chains.masks()[i]
            };
            for slot in 0..total {
                if get_bit(slot, selector) {
                    if let Some(upload) = slots.get(slot) {
                        xor_into(&mut response, &upload.body)
                            .map_err(|e| violation(e.to_string()))?;
                    }
                }
            }
            let pad = S::keystream(&chains.secrets()[i], self.block_size)
                .map_err(|e| violation(e.to_string()))?;
            xor_into(&mut response, &pad).map_err(|e| violation(e.to_string()))?;
        }
        chains.advance().map_err(|e| violation(e.to_string()))?;
        record.chain_round = query.round + 1;
        log.entry(("response", Some(query.id)))
            .or_default()
            .push(query.round);
        Ok(response)
    }
}

/// Per-server facade over a shared [`MockDirectory`].
pub struct MockServer<S: Suite = Ristretto> {
    directory: Arc<MockDirectory<S>>,
    index: usize,
}

#[async_trait]
impl<S: Suite> ServerRpc for MockServer<S> {
    async fn get_public_key(&self) -> Result<Vec<u8>, RpcError> {
        self.directory.get_public_key(self.index)
    }

    async fn register(&self, reg: &Registration) -> Result<u32, RpcError> {
        self.directory.register(self.index, reg)
    }

    async fn num_clients(&self) -> Result<usize, RpcError> {
        self.directory.num_clients()
    }

    async fn share_mask(&self, share: &DhShare) -> Result<Vec<u8>, RpcError> {
        self.directory.share(self.index, share, true)
    }

    async fn share_secret(&self, share: &DhShare) -> Result<Vec<u8>, RpcError> {
        self.directory.share(self.index, share, false)
    }

    async fn get_eph_key(&self) -> Result<Vec<u8>, RpcError> {
        self.directory.get_eph_key(self.index)
    }

    async fn request_block(&self, req: &BlockRequest) -> Result<(), RpcError> {
        self.directory.request_block(self.index, req)
    }

    async fn get_request_hashes(&self, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError> {
        self.directory.get_request_hashes(self.index, query)
    }

    async fn upload_block(&self, block: &SealedBlock) -> Result<(), RpcError> {
        self.directory.upload_block(self.index, block)
    }

    async fn get_upload_hashes(&self, query: &RoundQuery) -> Result<Vec<Vec<u8>>, RpcError> {
        self.directory.get_upload_hashes(self.index, query)
    }

    async fn get_response(&self, query: &PirQuery) -> Result<Vec<u8>, RpcError> {
        self.directory.get_response(self.index, query)
    }
}
