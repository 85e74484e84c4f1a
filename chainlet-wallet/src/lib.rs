//! The light node: a single-peer [`chainlet_p2p::Node`] caching UTXOs and
//! block headers rather than running full validation.

mod store;

pub use store::{load_wallet_file, save_wallet_file, WalletError};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chainlet_core::{Address, BlockHeader, Digest, Transaction, TxInput, TxOutput};
use chainlet_crypto::KeyPair;
use chainlet_ledger::{BroadcastRequest, PrivateRequest};
use chainlet_p2p::{Node, NodeCallbacks, NodeError, Verbosity};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// A light node connected to exactly one full node. `max_nodes = 1` on the
/// underlying overlay means it never discovers, or gossips to, anyone else.
pub struct Wallet {
    pub node: Arc<Node>,
    keys: KeyPair,
    pub address: Address,
    utxo: Mutex<Vec<Transaction>>,
    headers: Mutex<Vec<BlockHeader>>,
    proofs: Mutex<HashMap<Digest, (u64, Vec<Digest>)>>,
    address_book: Mutex<HashMap<String, String>>,
}

impl Wallet {
    pub async fn bind(
        keys: KeyPair,
        listen_host: impl Into<String>,
        listen_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<Arc<Self>, NodeError> {
        let node = Arc::new(
            Node::bind(
                listen_host,
                listen_port,
                Some((remote_host.into(), remote_port)),
                1,
                Verbosity::Silent,
            )
            .await?,
        );
        let address = keys.address();
        let wallet = Arc::new(Wallet {
            node: node.clone(),
            keys,
            address,
            utxo: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
            proofs: Mutex::new(HashMap::new()),
            address_book: Mutex::new(HashMap::new()),
        });
        node.set_callbacks(wallet.clone() as Arc<dyn NodeCallbacks>);
        Ok(wallet)
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        self.node.start().await
    }

    pub async fn shutdown(&self) {
        self.node.shutdown().await
    }

    pub fn public_key_string(&self) -> String {
        self.keys.public_key_string()
    }

    fn remote(&self) -> Option<(String, u16)> {
        self.node.neighbors().into_iter().next()
    }

    /// Adds `pubkey` to the address book under `name`, overwriting any
    /// prior entry. Address-book state is process-memory only.
    pub fn register(&self, name: &str, pubkey: &str) {
        self.address_book
            .lock()
            .insert(name.to_string(), pubkey.to_string());
    }

    /// Resolves `target` as a registered name first, falling back to
    /// treating it as a raw base58 public key.
    pub fn resolve_pubkey(&self, target: &str) -> String {
        self.address_book
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_else(|| target.to_string())
    }

    /// Requests the full node's view of this wallet's UTXOs. The cache is
    /// replaced, not merged, once the `BALANCE` reply arrives.
    pub async fn update_balance(&self) {
        let Some((host, port)) = self.remote() else {
            return;
        };
        let body = serde_json::to_value(PrivateRequest::GetBalance {
            address: self.address.clone(),
        })
        .unwrap();
        self.node.send_private(&host, port, body).await;
    }

    /// Sum of the cached UTXOs' outputs paying this wallet's address. Stale
    /// until `update_balance` is called and its reply has landed.
    pub fn get_balance(&self) -> u64 {
        self.utxo
            .lock()
            .iter()
            .filter_map(|tx| {
                tx.find_output_for(&self.address)
                    .map(|i| tx.output[i].value)
            })
            .sum()
    }

    /// Greedily selects cached UTXOs until their value covers `value`,
    /// signs one input per selected UTXO against its own body with `hash`
    /// removed, and broadcasts the resulting transaction. Returns the tx
    /// hash, or `None` if the cache is empty or insufficient.
    pub async fn transfer(&self, dest_pubkey: &str, value: u64) -> Option<Digest> {
        let dest_address = chainlet_crypto::address_from_public_key_string(dest_pubkey).ok()?;

        let (inputs, input_value, consumed) = {
            let utxo = self.utxo.lock();
            if utxo.is_empty() {
                return None;
            }
            let mut inputs = Vec::new();
            let mut input_value: u64 = 0;
            let mut consumed = 0usize;
            for prior in utxo.iter() {
                if input_value >= value {
                    break;
                }
                let Some(index) = prior.find_output_for(&self.address) else {
                    consumed += 1;
                    continue;
                };
                let signature = self.keys.sign(&prior.signing_body()).ok()?;
                inputs.push(TxInput {
                    prev_tx_hash: prior.hash.clone(),
                    index: index as u32,
                    unlock: signature,
                });
                input_value = input_value.saturating_add(prior.output[index].value);
                consumed += 1;
            }
            (inputs, input_value, consumed)
        };

        if input_value < value {
            return None;
        }

        self.utxo.lock().drain(..consumed);

        let mut outputs = vec![TxOutput {
            address: dest_address,
            value,
            lock: format!("{dest_pubkey} CHECKSIG"),
        }];
        let change = input_value - value;
        if change > 0 {
            outputs.push(TxOutput {
                address: self.address.clone(),
                value: change,
                lock: format!("{} CHECKSIG", self.public_key_string()),
            });
        }

        let tx = Transaction::new(inputs, outputs);
        let hash = tx.hash.clone();
        let body = serde_json::to_value(BroadcastRequest::Transact { tx }).unwrap();
        self.node.broadcast(body).await;
        Some(hash)
    }

    /// Broadcasts an empty transaction, used to bootstrap or wake mining
    /// when no real transfer is pending.
    pub async fn empty_transfer(&self) {
        let tx = Transaction::empty();
        let body = serde_json::to_value(BroadcastRequest::Transact { tx }).unwrap();
        self.node.broadcast(body).await;
    }

    /// Requests the full chain and replaces the local header cache once the
    /// `LIST_BLOCKS` reply arrives. No proof-of-work is re-verified; the
    /// wallet trusts its one peer.
    pub async fn sync_block(&self) {
        let Some((host, port)) = self.remote() else {
            return;
        };
        let body = serde_json::to_value(PrivateRequest::GetBlocks).unwrap();
        self.node.send_private(&host, port, body).await;
    }

    pub fn block_count(&self) -> usize {
        self.headers.lock().len()
    }

    /// Requests a Merkle inclusion proof for `txid`, cached under
    /// `proof_tx[txid]` once the `PROOF` reply arrives.
    pub async fn get_proof(&self, txid: &str) {
        let Some((host, port)) = self.remote() else {
            return;
        };
        let body = serde_json::to_value(PrivateRequest::GetProof {
            txid: txid.to_string(),
        })
        .unwrap();
        self.node.send_private(&host, port, body).await;
    }

    /// Verifies a previously-fetched proof against the cached header's
    /// Merkle root. Fails if no proof is cached, or if it names a block
    /// beyond the header cache's current length.
    pub fn verify_proof(&self, txid: &str) -> bool {
        let proofs = self.proofs.lock();
        let Some((index, proof)) = proofs.get(txid) else {
            return false;
        };
        let headers = self.headers.lock();
        let Some(header) = headers.get(*index as usize) else {
            return false;
        };
        let Some(root) = &header.root else {
            return false;
        };
        chainlet_core::MerkleTree::verify_proof(txid, root, proof)
    }

    fn handle_balance(&self, address: String, utxo: Vec<Transaction>) {
        if address != self.address {
            return;
        }
        *self.utxo.lock() = utxo;
    }

    fn handle_list_blocks(&self, blocks: Vec<chainlet_core::Block>) {
        *self.headers.lock() = blocks.iter().map(|b| b.header()).collect();
    }

    fn handle_proof(&self, txid: String, index: u64, proof: Vec<Digest>) {
        self.proofs.lock().insert(txid, (index, proof));
    }
}

#[async_trait]
impl NodeCallbacks for Wallet {
    async fn on_private(&self, _host: String, _port: u16, body: Value) {
        let request: PrivateRequest = match serde_json::from_value(body) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "malformed private body, dropping");
                return;
            }
        };
        match request {
            PrivateRequest::Balance { address, utxo } => self.handle_balance(address, utxo),
            PrivateRequest::ListBlocks { blocks } => self.handle_list_blocks(blocks),
            PrivateRequest::Proof { txid, index, proof } => self.handle_proof(txid, index, proof),
            // A wallet never serves GET_BALANCE/GET_BLOCKS/GET_PROOF itself.
            PrivateRequest::GetBlocks
            | PrivateRequest::GetBalance { .. }
            | PrivateRequest::GetProof { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlet_core::{Block, TxOutput as Out};
    use chainlet_ledger::Ledger;

    fn signed_utxo(keys: &KeyPair, address: &Address, value: u64) -> Transaction {
        let tx = Transaction::new(
            Vec::new(),
            vec![Out {
                address: address.clone(),
                value,
                lock: format!("{} CHECKSIG", keys.public_key_string()),
            }],
        );
        tx
    }

    #[test]
    fn get_balance_sums_only_matching_outputs() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let address = keys.address();

        let mine = signed_utxo(&keys, &address, 10);
        let not_mine = signed_utxo(&other, &other.address(), 99);

        let wallet_utxo = vec![mine, not_mine];
        let total: u64 = wallet_utxo
            .iter()
            .filter_map(|tx| tx.find_output_for(&address).map(|i| tx.output[i].value))
            .sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn verify_proof_checks_against_cached_root() {
        let ledger = Ledger::new(1);
        let tx = Transaction::empty();
        let mut block = Block {
            index: 0,
            hash: None,
            nonce: 0,
            trans: vec![tx.clone()],
            root: Some(tx.hash.clone()),
        };
        loop {
            let hash = block.pow_hash().unwrap();
            if chainlet_core::meets_difficulty(&hash, ledger.difficulty()) {
                break;
            }
            block.nonce += 1;
        }
        assert!(ledger.add_block(block.clone()));

        assert!(chainlet_core::MerkleTree::verify_proof(
            &tx.hash,
            block.root.as_ref().unwrap(),
            &[],
        ));
    }
}
