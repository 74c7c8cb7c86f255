//! End-to-end rounds against the in-memory honest server set.

use std::sync::Arc;

use brume_client::{Client, MockDirectory};
use brume_core::{BlockStore, ClientConfig, ContentHash, Ristretto, Suite};

const BLOCK_SIZE: usize = 1024;
const SERVERS: usize = 3;

fn padded(data: &[u8]) -> Vec<u8> {
    let mut block = data.to_vec();
    block.resize(BLOCK_SIZE, 0);
    block
}

fn config(addr: &str, window: usize) -> ClientConfig {
    let servers = (0..SERVERS).map(|i| format!("server-{i}:7000")).collect();
    let mut cfg = ClientConfig::new(addr, servers, "server-0:7000");
    cfg.block_size = BLOCK_SIZE;
    cfg.max_rounds = window;
    cfg
}

async fn connect(
    directory: &Arc<MockDirectory>,
    addr: &str,
    store: BlockStore<Ristretto>,
    window: usize,
) -> Client {
    Client::connect(config(addr, window), directory.handles(), store)
        .await
        .expect("client connects")
}

fn store_with(blocks: &[&[u8]]) -> (BlockStore<Ristretto>, Vec<ContentHash>) {
    let mut store = BlockStore::new(BLOCK_SIZE).expect("store");
    let hashes = blocks
        .iter()
        .map(|b| store.insert_block(b).expect("block fits"))
        .collect();
    (store, hashes)
}

async fn finish_setup(clients: &[&Client]) {
    for client in clients {
        client.register(0).await.expect("register");
    }
    for client in clients {
        client.register_done().await.expect("register done");
        client.share_secrets().await.expect("share secrets");
    }
}

#[tokio::test]
async fn single_client_round_trip() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store, hashes) = store_with(&[&b"hello world"[..]]);
    let client = connect(&directory, "client-a:9000", store, 16).await;
    finish_setup(&[&client]).await;

    client.request_block(0, hashes[0]).await.expect("request");
    client.upload().await.expect("upload");
    let block = client.download().await.expect("download");

    assert_eq!(block.len(), BLOCK_SIZE);
    assert_eq!(Ristretto::hash(&block), hashes[0]);
    assert_eq!(block, padded(b"hello world"));
}

#[tokio::test]
async fn clients_serve_each_other() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store_a, hashes_a) = store_with(&[&b"held by a, wanted by b"[..]]);
    let (store_b, hashes_b) = store_with(&[&b"held by b, wanted by a"[..]]);
    let a = connect(&directory, "client-a:9000", store_a, 16).await;
    let b = connect(&directory, "client-b:9000", store_b, 16).await;
    finish_setup(&[&a, &b]).await;

    a.request_block(0, hashes_b[0]).await.expect("a requests");
    b.request_block(1, hashes_a[0]).await.expect("b requests");
    a.upload().await.expect("a uploads");
    b.upload().await.expect("b uploads");

    let got_a = a.download().await.expect("a downloads");
    let got_b = b.download().await.expect("b downloads");
    assert_eq!(got_a, padded(b"held by b, wanted by a"));
    assert_eq!(got_b, padded(b"held by a, wanted by b"));
}

#[tokio::test]
async fn missing_hash_fails_anonymously_and_rounds_continue() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store, hashes) = store_with(&[&b"present block"[..]]);
    let client = connect(&directory, "client-a:9000", store, 16).await;
    finish_setup(&[&client]).await;

    // Nobody holds this hash; the upload round produces a zero block.
    client
        .request_block(0, [0xab; 32])
        .await
        .expect("request for absent hash");
    client.upload().await.expect("upload still runs");
    let miss = client.download().await.expect("download returns");
    assert!(miss.is_empty());

    // The next round is unaffected: chains stayed aligned through the miss.
    client.request_block(0, hashes[0]).await.expect("request");
    client.upload().await.expect("upload");
    let block = client.download().await.expect("download");
    assert_eq!(block, padded(b"present block"));
}

#[tokio::test]
async fn downloads_follow_request_order() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store, hashes) = store_with(&[&b"first"[..], b"second", b"third"]);
    let client = connect(&directory, "client-a:9000", store, 16).await;
    finish_setup(&[&client]).await;

    for hash in &hashes {
        client.request_block(0, *hash).await.expect("request");
    }
    for _ in 0..hashes.len() {
        client.upload().await.expect("upload");
    }
    for (hash, content) in hashes.iter().zip([&b"first"[..], b"second", b"third"]) {
        let block = client.download().await.expect("download");
        assert_eq!(Ristretto::hash(&block), *hash);
        assert_eq!(block, padded(content));
    }
}

#[tokio::test]
async fn chains_track_the_server_mirror() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store, hashes) = store_with(&[&b"chained block"[..]]);
    let client = connect(&directory, "client-a:9000", store, 16).await;
    finish_setup(&[&client]).await;

    let (masks_0, secrets_0) = client.chain_snapshot().await.expect("seeded");
    let id = client.id().expect("registered");

    for _ in 0..5 {
        client.request_block(0, hashes[0]).await.expect("request");
        client.upload().await.expect("upload");
        let block = client.download().await.expect("download");
        assert_eq!(Ristretto::hash(&block), hashes[0]);

        let (masks, secrets) = client.chain_snapshot().await.expect("chains live");
        let (mirror_masks, mirror_secrets) = directory.chain_mirror(id).expect("mirror live");
        assert_eq!(masks, mirror_masks);
        assert_eq!(secrets, mirror_secrets);
    }

    // Five advances equal five keystream iterations of each seeded state.
    let iterate = |state: &[u8]| {
        let mut current = state.to_vec();
        for _ in 0..5 {
            current = Ristretto::keystream(&current, current.len()).expect("keystream");
        }
        current
    };
    let (masks_5, secrets_5) = client.chain_snapshot().await.expect("chains live");
    for (seed, now) in masks_0.iter().zip(&masks_5) {
        assert_eq!(&iterate(seed), now);
    }
    for (seed, now) in secrets_0.iter().zip(&secrets_5) {
        assert_eq!(&iterate(seed), now);
    }
}

#[tokio::test]
async fn request_vector_is_one_hot_on_the_wire() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store_a, _) = store_with(&[]);
    let (store_b, _) = store_with(&[]);
    let a = connect(&directory, "client-a:9000", store_a, 16).await;
    let b = connect(&directory, "client-b:9000", store_b, 16).await;
    finish_setup(&[&a, &b]).await;

    let hash = Ristretto::hash(b"wanted");
    b.request_block(1, hash).await.expect("request");

    let seen = directory.last_request().expect("request recorded");
    assert_eq!(seen.round, 0);
    assert_eq!(seen.hashes.len(), 2);
    assert_eq!(seen.hashes[0], vec![0u8; 32]);
    assert_eq!(seen.hashes[1], hash.to_vec());
    let nonzero = seen.hashes.iter().filter(|h| h.iter().any(|&b| b != 0)).count();
    assert_eq!(nonzero, 1);
}

#[tokio::test]
async fn interleaved_lanes_keep_rounds_ordered() {
    let directory = Arc::new(MockDirectory::new(SERVERS, BLOCK_SIZE));
    let (store, hashes) = store_with(&[&b"looping block"[..]]);
    let client = Arc::new(connect(&directory, "client-a:9000", store, 64).await);
    finish_setup(&[client.as_ref()]).await;
    let id = client.id().expect("registered");

    const ROUNDS: u64 = 50;
    let requester = {
        let client = client.clone();
        let hash = hashes[0];
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                client.request_block(0, hash).await.expect("request");
            }
        })
    };
    let uploader = {
        let client = client.clone();
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                client.upload().await.expect("upload");
            }
        })
    };
    requester.await.expect("request task");
    uploader.await.expect("upload task");

    let expected: Vec<u64> = (0..ROUNDS).collect();
    assert_eq!(directory.rounds_seen("request", Some(id)), expected);
    assert_eq!(directory.rounds_seen("request-hashes", Some(id)), expected);
    assert_eq!(directory.rounds_seen("upload", None), expected);
}
