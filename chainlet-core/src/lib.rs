//! Data model and hashing primitives shared by every node role: the
//! transaction/block shapes, canonical SHA-256 hashing, and the Merkle tree
//! used for light-client inclusion proofs.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Hex-encoded SHA-256 digest. Used for transaction ids, block hashes and
/// Merkle node hashes alike.
pub type Digest = String;

/// Base58-encoded address, derived from a public key by `chainlet-crypto`.
pub type Address = String;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to encode object as canonical JSON: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("hash {0} is not a leaf of this tree")]
    UnknownLeaf(String),
}

/// SHA-256 hex digest of the canonical JSON encoding of `obj`.
///
/// Canonicalization here means simply "serde's declared field order" -- since
/// every hashed type in this crate is a plain `#[derive(Serialize)]` struct
/// with a fixed field order, this is deterministic across builds from the
/// same source, which is the property every node needs to agree on wire
/// hashes.
pub fn sha256<T: Serialize>(obj: &T) -> Result<Digest, CoreError> {
    let bytes = serde_json::to_vec(obj)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Commutative combination of two hex digests: SHA-256 of the decimal string
/// representation of `int(h1, 16) + int(h2, 16)`. Used to build Merkle
/// parents; since addition is commutative, proof sibling order never needs
/// recording.
pub fn sum_hash(h1: &str, h2: &str) -> Digest {
    let a = hex::decode(h1).unwrap_or_default();
    let b = hex::decode(h2).unwrap_or_default();
    let sum = add_big_endian(&a, &b);
    let decimal = big_endian_to_decimal(&sum);
    let mut hasher = Sha256::new();
    hasher.update(decimal.as_bytes());
    hex::encode(hasher.finalize())
}

/// Adds two big-endian byte strings of possibly different length, returning
/// the big-endian result (one byte longer than the longer input in the
/// worst case, to hold the final carry).
fn add_big_endian(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len + 1);
    let mut carry: u16 = 0;
    for i in 0..len {
        let av = a.get(a.len().wrapping_sub(1 + i)).copied().unwrap_or(0) as u16;
        let bv = b.get(b.len().wrapping_sub(1 + i)).copied().unwrap_or(0) as u16;
        let sum = av + bv + carry;
        out.push((sum & 0xff) as u8);
        carry = sum >> 8;
    }
    if carry > 0 {
        out.push(carry as u8);
    }
    out.reverse();
    out
}

/// Converts a big-endian byte string into its base-10 string representation
/// via repeated divide-by-ten (long division on the byte array).
fn big_endian_to_decimal(bytes: &[u8]) -> String {
    let mut digits = bytes.to_vec();
    while digits.len() > 1 && digits[0] == 0 {
        digits.remove(0);
    }
    if digits == [0] {
        return "0".to_string();
    }
    let mut decimal = Vec::new();
    while !(digits.len() == 1 && digits[0] == 0) {
        let mut remainder: u32 = 0;
        let mut next = Vec::with_capacity(digits.len());
        for &d in &digits {
            let acc = remainder * 256 + d as u32;
            next.push((acc / 10) as u8);
            remainder = acc % 10;
        }
        while next.len() > 1 && next[0] == 0 {
            next.remove(0);
        }
        decimal.push(std::char::from_digit(remainder, 10).unwrap());
        digits = next;
    }
    decimal.iter().rev().collect()
}

/// A single spent-output reference plus the unlock argument that authorizes
/// spending it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    #[serde(rename = "prevTxHash")]
    pub prev_tx_hash: Digest,
    pub index: u32,
    pub unlock: String,
}

/// A single new UTXO: an amount locked to an address under a spend script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub address: Address,
    pub value: u64,
    pub lock: String,
}

/// Body hashed to produce a transaction's identity -- everything except the
/// derived `hash` field itself.
#[derive(Serialize)]
struct TxBody<'a> {
    locktime: f64,
    input: &'a [TxInput],
    output: &'a [TxOutput],
}

/// A transfer of value: inputs consume prior outputs, outputs create new
/// ones. Zero inputs and zero outputs is a valid "empty" transaction used to
/// bootstrap mining; zero inputs and exactly one output is a coinbase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub locktime: f64,
    pub input: Vec<TxInput>,
    pub output: Vec<TxOutput>,
    pub hash: Digest,
}

impl Transaction {
    /// Builds and hashes a fresh transaction with the given inputs/outputs,
    /// stamping `locktime` with the current wall-clock time.
    pub fn new(input: Vec<TxInput>, output: Vec<TxOutput>) -> Self {
        let locktime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut tx = Transaction {
            locktime,
            input,
            output,
            hash: String::new(),
        };
        tx.hash = tx.compute_hash().expect("transaction always serializes");
        tx
    }

    /// An empty transaction (no inputs, no outputs), used to wake up a
    /// miner or bootstrap the first block.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    fn compute_hash(&self) -> Result<Digest, CoreError> {
        sha256(&TxBody {
            locktime: self.locktime,
            input: &self.input,
            output: &self.output,
        })
    }

    /// Re-derives `hash` from the current `locktime`/`input`/`output` and
    /// checks it against the stored value -- used when decoding a
    /// transaction received over the wire.
    pub fn verify_hash(&self) -> bool {
        self.compute_hash().map(|h| h == self.hash).unwrap_or(false)
    }

    pub fn is_empty_transfer(&self) -> bool {
        self.input.is_empty() && self.output.is_empty()
    }

    pub fn is_coinbase(&self) -> bool {
        self.input.is_empty() && self.output.len() == 1
    }

    /// Index of the output paying `address`, if any. A transaction is
    /// assumed to pay a given address at most once.
    pub fn find_output_for(&self, address: &str) -> Option<usize> {
        self.output.iter().position(|o| o.address == address)
    }

    /// The body a lock/unlock script is evaluated against: the transaction
    /// dict with its own `hash` field removed, matching the stack
    /// language's `tx.pop("hash")` step.
    pub fn signing_body(&self) -> impl Serialize + '_ {
        TxBody {
            locktime: self.locktime,
            input: &self.input,
            output: &self.output,
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state)
    }
}

/// A block header with the transaction list elided -- what light clients
/// (wallets) keep instead of the full chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub hash: Option<Digest>,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Digest>,
}

/// A full block: the hash of the previous block (`None` at genesis), a
/// nonce varied by mining, and the ordered transaction list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub hash: Option<Digest>,
    pub nonce: u64,
    pub trans: Vec<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Digest>,
}

impl Block {
    /// SHA-256 of the canonical encoding of the whole block -- the value
    /// that must carry `difficulty` leading zero hex digits, and the value
    /// the next block's `hash` field must equal.
    pub fn pow_hash(&self) -> Result<Digest, CoreError> {
        sha256(self)
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            index: self.index,
            hash: self.hash.clone(),
            nonce: self.nonce,
            root: self.root.clone(),
        }
    }

    pub fn coinbase_count(&self) -> usize {
        self.trans.iter().filter(|t| t.is_coinbase()).count()
    }
}

/// Does `hash` carry `difficulty` leading zero hex digits?
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.as_bytes().iter().take(difficulty).all(|&b| b == b'0')
}

#[derive(Debug, Clone)]
struct MerkleNode {
    hash: Digest,
    level: usize,
    left: Option<Box<MerkleNode>>,
    right: Option<Box<MerkleNode>>,
}

impl MerkleNode {
    fn leaf(hash: Digest) -> Self {
        MerkleNode {
            hash,
            level: 0,
            left: None,
            right: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Merkle tree over an ordered list of leaf hashes, built bottom-up by
/// pairing siblings with [`sum_hash`]. An odd node at any level is promoted
/// unchanged rather than duplicated.
pub struct MerkleTree {
    leaves: Vec<Digest>,
    root: MerkleNode,
}

impl MerkleTree {
    /// Builds a tree over `hashes`. Returns `None` for an empty input --
    /// callers are expected to have at least one transaction hash per
    /// block.
    pub fn build(hashes: Vec<Digest>) -> Option<Self> {
        if hashes.is_empty() {
            return None;
        }
        let mut level = 0usize;
        let mut nodes: Vec<MerkleNode> = hashes.iter().cloned().map(MerkleNode::leaf).collect();
        while nodes.len() > 1 {
            level += 1;
            let mut next = Vec::with_capacity((nodes.len() + 1) / 2);
            let mut it = nodes.into_iter();
            loop {
                let Some(left) = it.next() else { break };
                match it.next() {
                    Some(right) => {
                        let combined = sum_hash(&left.hash, &right.hash);
                        next.push(MerkleNode {
                            hash: combined,
                            level,
                            left: Some(Box::new(left)),
                            right: Some(Box::new(right)),
                        });
                    }
                    None => next.push(left),
                }
            }
            nodes = next;
        }
        Some(MerkleTree {
            leaves: hashes,
            root: nodes.into_iter().next().expect("non-empty after loop"),
        })
    }

    pub fn root(&self) -> &Digest {
        &self.root.hash
    }

    /// Builds the inclusion proof for `hash`: a list of sibling hashes
    /// collected while descending from the root to the leaf. Empty for a
    /// single-leaf tree.
    pub fn proof(&self, hash: &str) -> Result<Vec<Digest>, CoreError> {
        let index = self
            .leaves
            .iter()
            .position(|h| h == hash)
            .ok_or_else(|| CoreError::UnknownLeaf(hash.to_string()))?;
        let mut proof = Vec::new();
        let mut node = &self.root;
        let mut index = index;
        loop {
            if node.is_leaf() {
                break;
            }
            let left = node.left.as_ref().expect("internal node has left child");
            let half = 1usize << (node.level - 1);
            if index < half {
                if let Some(right) = &node.right {
                    proof.push(right.hash.clone());
                }
                node = left;
            } else {
                proof.push(left.hash.clone());
                index -= half;
                node = node
                    .right
                    .as_ref()
                    .expect("descending right implies a right child exists");
            }
        }
        Ok(proof)
    }

    /// Verifies an inclusion proof by folding sibling hashes back up to the
    /// root, right-to-left.
    pub fn verify_proof(hash: &str, root: &str, proof: &[Digest]) -> bool {
        let mut acc = hash.to_string();
        for sibling in proof.iter().rev() {
            acc = sum_hash(&acc, sibling);
        }
        acc == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_empty() -> Transaction {
        Transaction::empty()
    }

    fn tx_with_output(address: &str, value: u64) -> Transaction {
        Transaction::new(
            vec![],
            vec![TxOutput {
                address: address.to_string(),
                value,
                lock: format!("{address} CHECKSIG"),
            }],
        )
    }

    #[test]
    fn transaction_hash_round_trips() {
        let tx = tx_with_output("alice", 10);
        let encoded = serde_json::to_vec(&tx).unwrap();
        let decoded: Transaction = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.hash, tx.hash);
        assert!(decoded.verify_hash());
    }

    #[test]
    fn empty_and_coinbase_classification() {
        let empty = tx_empty();
        assert!(empty.is_empty_transfer());
        assert!(!empty.is_coinbase());

        let coinbase = tx_with_output("miner", 50);
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_empty_transfer());
    }

    #[test]
    fn sum_hash_is_commutative() {
        let a = sha256(&"left").unwrap();
        let b = sha256(&"right").unwrap();
        assert_eq!(sum_hash(&a, &b), sum_hash(&b, &a));
    }

    #[test]
    fn block_round_trip_preserves_hash_inputs() {
        let tx = tx_with_output("bob", 5);
        let block = Block {
            index: 0,
            hash: None,
            nonce: 42,
            trans: vec![tx],
            root: None,
        };
        let h1 = block.pow_hash().unwrap();
        let encoded = serde_json::to_vec(&block).unwrap();
        let decoded: Block = serde_json::from_slice(&encoded).unwrap();
        let h2 = decoded.pow_hash().unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn meets_difficulty_checks_prefix() {
        assert!(meets_difficulty("000abc", 3));
        assert!(!meets_difficulty("00abc", 3));
    }

    #[test]
    fn merkle_proofs_validate_for_six_leaves() {
        let hashes: Vec<Digest> = (0..6).map(|i| sha256(&i).unwrap()).collect();
        let tree = MerkleTree::build(hashes.clone()).unwrap();
        for (i, h) in hashes.iter().enumerate() {
            let proof = tree.proof(h).unwrap();
            if i < 4 {
                assert_eq!(proof.len(), 3);
            } else {
                assert_eq!(proof.len(), 2);
            }
            assert!(MerkleTree::verify_proof(h, tree.root(), &proof));
            for (j, other) in hashes.iter().enumerate() {
                if j != i {
                    assert!(!MerkleTree::verify_proof(other, tree.root(), &proof));
                }
            }
        }
    }

    #[test]
    fn single_leaf_tree_has_empty_proof() {
        let h = sha256(&"solo").unwrap();
        let tree = MerkleTree::build(vec![h.clone()]).unwrap();
        let proof = tree.proof(&h).unwrap();
        assert!(proof.is_empty());
        assert_eq!(tree.root(), &h);
        assert!(MerkleTree::verify_proof(&h, tree.root(), &proof));
    }
}
