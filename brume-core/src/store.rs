//! Local block store: filename to (content hash to byte extent).
//!
//! Indexed once at startup and read-only afterwards, so the upload path can
//! scan it without locking. Files are split into fixed-size blocks (the last
//! one zero-padded for hashing) and addressed by the hash of the padded
//! block. A separate piece table holds loose hash-addressed blocks that were
//! handed over directly rather than read from disk.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::Path;

use crate::error::Error;
use crate::suite::{Suite, DIGEST_LEN};

pub type ContentHash = [u8; DIGEST_LEN];

pub struct BlockStore<S: Suite> {
    block_size: usize,
    files: BTreeMap<String, FileEntry>,
    pieces: HashMap<ContentHash, Vec<u8>>,
    _suite: PhantomData<S>,
}

struct FileEntry {
    handle: File,
    blocks: HashMap<ContentHash, Extent>,
}

#[derive(Clone, Copy, Debug)]
struct Extent {
    offset: u64,
    len: usize,
}

/// Where a matched block lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockLocation {
    File {
        name: String,
        offset: u64,
        len: usize,
    },
    Piece {
        hash: ContentHash,
    },
}

impl<S: Suite> BlockStore<S> {
    pub fn new(block_size: usize) -> Result<Self, Error> {
        if block_size == 0 {
            return Err(Error::InvalidConfig("block size must be non-zero".into()));
        }
        Ok(Self {
            block_size,
            files: BTreeMap::new(),
            pieces: HashMap::new(),
            _suite: PhantomData,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Split the file at `path` into blocks and index each block's hash.
    /// Returns the number of blocks indexed.
    pub fn index_file(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<usize, Error> {
        let mut handle = File::open(path)?;
        let mut blocks = HashMap::new();
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; self.block_size];
            let len = read_fill(&mut handle, &mut buf)?;
            if len == 0 {
                break;
            }
            blocks.insert(S::hash(&buf), Extent { offset, len });
            offset += len as u64;
            if len < self.block_size {
                break;
            }
        }
        let indexed = blocks.len();
        self.files.insert(name.into(), FileEntry { handle, blocks });
        Ok(indexed)
    }

    /// Add a loose block to the piece table, zero-padding it to the block
    /// size. Returns the hash it is addressed by.
    pub fn insert_block(&mut self, block: &[u8]) -> Result<ContentHash, Error> {
        if block.len() > self.block_size {
            return Err(Error::LengthMismatch {
                expected: self.block_size,
                actual: block.len(),
            });
        }
        let mut padded = block.to_vec();
        padded.resize(self.block_size, 0);
        let hash = S::hash(&padded);
        self.pieces.insert(hash, padded);
        Ok(hash)
    }

    /// First local block whose hash appears in `wanted`. Files are scanned
    /// before loose pieces; within a file set the first hit wins.
    pub fn find(&self, wanted: &[ContentHash]) -> Option<BlockLocation> {
        for (name, entry) in &self.files {
            for hash in wanted {
                if let Some(extent) = entry.blocks.get(hash) {
                    return Some(BlockLocation::File {
                        name: name.clone(),
                        offset: extent.offset,
                        len: extent.len,
                    });
                }
            }
        }
        for hash in wanted {
            if self.pieces.contains_key(hash) {
                return Some(BlockLocation::Piece { hash: *hash });
            }
        }
        None
    }

    /// Read the block at `loc`, zero-padded to exactly the block size. A
    /// location that no longer resolves, or a file that comes up short of
    /// its indexed extent, is an error.
    pub fn read_block(&self, loc: &BlockLocation) -> Result<Vec<u8>, Error> {
        match loc {
            BlockLocation::File { name, offset, len } => {
                let entry = self
                    .files
                    .get(name)
                    .ok_or_else(|| Error::Store(format!("unknown file {name:?}")))?;
                let mut buf = vec![0u8; self.block_size];
                let mut handle = &entry.handle;
                handle.seek(SeekFrom::Start(*offset))?;
                handle.read_exact(&mut buf[..*len])?;
                Ok(buf)
            }
            BlockLocation::Piece { hash } => self
                .pieces
                .get(hash)
                .cloned()
                .ok_or_else(|| Error::Store("piece evicted".into())),
        }
    }
}

fn read_fill(mut reader: impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
