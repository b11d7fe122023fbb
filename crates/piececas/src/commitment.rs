//! Piece commitment: a binary SHA-256 merkle root over 32-byte leaves.
//!
//! The payload is cut into 32-byte leaves (the last one zero padded), the leaf
//! count is rounded up to a power of two (at least 4) with all-zero leaves,
//! and each parent is `sha256(left || right)` with the two high bits of the
//! final byte cleared. Because padding leaves are zero, committing to a file
//! that was zero padded to its piece size yields the same root as committing
//! to the unpadded payload.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::hash::CommitmentId;

const LEAF_SIZE: usize = 32;
const MIN_LEAVES: u64 = 4;

/// Result of committing to a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceCommitment {
    pub root: CommitmentId,
    /// Bytes actually committed to.
    pub payload_size: u64,
    /// Padded size of the piece, always a power of two.
    pub piece_size: u64,
}

impl PieceCommitment {
    /// Commit to an in-memory payload.
    pub fn compute(data: &[u8]) -> Self {
        let mut tree = TreeBuilder::default();
        for chunk in data.chunks(LEAF_SIZE) {
            tree.push_leaf(leaf_from(chunk));
        }
        tree.finish(data.len() as u64)
    }

    /// Commit to a stream without holding it in memory.
    pub fn compute_reader(reader: impl Read) -> io::Result<Self> {
        let mut reader = BufReader::new(reader);
        let mut tree = TreeBuilder::default();
        let mut total = 0u64;
        let mut buf = [0u8; LEAF_SIZE];

        loop {
            let mut filled = 0;
            while filled < LEAF_SIZE {
                let n = reader.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            total += filled as u64;
            tree.push_leaf(leaf_from(&buf[..filled]));
            if filled < LEAF_SIZE {
                break;
            }
        }

        Ok(tree.finish(total))
    }
}

fn leaf_from(chunk: &[u8]) -> [u8; 32] {
    let mut leaf = [0u8; 32];
    leaf[..chunk.len()].copy_from_slice(chunk);
    leaf
}

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out: [u8; 32] = hasher.finalize().into();
    out[31] &= 0b0011_1111;
    out
}

/// Streaming merkle builder: keeps one pending node per level.
#[derive(Default)]
struct TreeBuilder {
    stack: Vec<(u32, [u8; 32])>,
    leaves: u64,
}

impl TreeBuilder {
    fn push_leaf(&mut self, leaf: [u8; 32]) {
        self.push_node(0, leaf);
        self.leaves += 1;
    }

    fn push_node(&mut self, level: u32, hash: [u8; 32]) {
        let mut node = (level, hash);
        while let Some(&(top_level, top_hash)) = self.stack.last() {
            if top_level != node.0 {
                break;
            }
            self.stack.pop();
            node = (top_level + 1, hash_pair(&top_hash, &node.1));
        }
        self.stack.push(node);
    }

    fn finish(mut self, payload_size: u64) -> PieceCommitment {
        let leaf_count = self.leaves.max(MIN_LEAVES).next_power_of_two();
        let depth = leaf_count.trailing_zeros();

        // zero_roots[i] is the root of an all-zero subtree with 2^i leaves
        let mut zero_roots = Vec::with_capacity(depth as usize + 1);
        zero_roots.push([0u8; 32]);
        for i in 0..depth as usize {
            zero_roots.push(hash_pair(&zero_roots[i], &zero_roots[i]));
        }

        let root = loop {
            let single = self.stack.len() == 1;
            match self.stack.last().copied() {
                None => break zero_roots[depth as usize],
                Some((level, hash)) if single && level == depth => break hash,
                Some((level, _)) => self.push_node(level, zero_roots[level as usize]),
            }
        };

        PieceCommitment {
            root: CommitmentId::from_bytes(root),
            payload_size,
            piece_size: leaf_count * LEAF_SIZE as u64,
        }
    }
}

/// Commit to a file on disk.
///
/// With `add_padding` the file is extended with zeros to its piece size. With
/// `rename` it is moved next to itself under the commitment id.
pub fn commit_file(path: &Path, rename: bool, add_padding: bool) -> Result<PieceCommitment> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let commitment = PieceCommitment::compute_reader(file)
        .with_context(|| format!("failed to read {}", path.display()))?;

    if add_padding {
        pad_file(path, commitment.piece_size)?;
    }

    if rename {
        let target = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(commitment.root.to_string());
        fs::rename(path, &target)
            .with_context(|| format!("failed to rename {} to {}", path.display(), target.display()))?;
    }

    Ok(commitment)
}

/// Zero-extend a file to `piece_size` bytes. Never shrinks.
pub fn pad_file(path: &Path, piece_size: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {} for padding", path.display()))?;
    let current = file.metadata().context("failed to stat archive")?.len();
    if current < piece_size {
        file.set_len(piece_size)
            .with_context(|| format!("failed to pad {}", path.display()))?;
    }
    Ok(())
}
