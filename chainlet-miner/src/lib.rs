//! The mining loop: buffers candidate transactions until a block's worth are
//! available, assembles a coinbase-paying candidate block, and searches for
//! a nonce satisfying the ledger's difficulty -- abandoning the search the
//! moment a peer's block lands first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chainlet_core::{Block, Transaction, TxOutput};
use chainlet_ledger::FullNode;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Wraps a [`FullNode`] with a background nonce-search task paying a fixed
/// reward address on every block it wins.
pub struct Miner {
    full_node: Arc<FullNode>,
    reward_pubkey: String,
    reward_address: String,
    block_size: usize,
    is_mining: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    /// Wraps `full_node`, installing both the transact-hook that wakes the
    /// mining loop once enough candidates are buffered, and the
    /// ledger-changed hook that abandons an in-flight nonce search once a
    /// peer's block has already extended the chain.
    pub fn bind(
        full_node: Arc<FullNode>,
        reward_pubkey: String,
        block_size: usize,
    ) -> Result<Arc<Self>, chainlet_crypto::CryptoError> {
        let reward_address = chainlet_crypto::address_from_public_key_string(&reward_pubkey)?;
        let is_mining = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let miner = Arc::new(Miner {
            full_node: full_node.clone(),
            reward_pubkey,
            reward_address,
            block_size: block_size.max(1),
            is_mining,
            notify,
            handle: parking_lot::Mutex::new(None),
        });

        let wake = miner.notify.clone();
        full_node.set_on_transact(Arc::new(move || wake.notify_one()));

        let stop_flag = miner.is_mining.clone();
        let wake_after_chain_change = miner.notify.clone();
        full_node.set_on_ledger_changed(Arc::new(move || {
            stop_flag.store(false, Ordering::SeqCst);
            wake_after_chain_change.notify_one();
        }));

        Ok(miner)
    }

    /// Spawns the background mining loop. Idempotent: a second call is a
    /// no-op while a loop is already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let miner = self.clone();
        *handle = Some(tokio::spawn(async move { miner.run().await }));
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let required = self.block_size.saturating_sub(1);
            while self.full_node.ledger.candidate_count() < required
                && self.full_node.ledger.height() > 0
            {
                self.notify.notified().await;
            }

            let candidates = self
                .full_node
                .ledger
                .sample_valid_candidates(required);
            // Eviction during validation can drop the survivors below what's
            // needed; wait for a fresh batch rather than mine a short block.
            // The empty ledger is exempt: genesis may be mined with no
            // pending transactions at all.
            if candidates.len() < required && self.full_node.ledger.height() > 0 {
                continue;
            }
            let block = self.build_candidate(candidates);
            if let Some(won) = self.search(block).await {
                self.full_node.ledger.add_block(won.clone());
                self.full_node.submit_block(won).await;
            }
        }
    }

    fn build_candidate(&self, mut trans: Vec<Transaction>) -> Block {
        let coinbase = Transaction::new(
            Vec::new(),
            vec![TxOutput {
                address: self.reward_address.clone(),
                value: chainlet_ledger::COINBASE_REWARD,
                lock: format!("{} CHECKSIG", self.reward_pubkey),
            }],
        );
        trans.insert(0, coinbase);

        let hashes: Vec<_> = trans.iter().map(|tx| tx.hash.clone()).collect();
        let root = chainlet_core::MerkleTree::build(hashes).map(|tree| tree.root().clone());
        let prior_hash = self.full_node.ledger.last_hash();
        Block {
            index: self.full_node.ledger.height() as u64,
            hash: prior_hash,
            nonce: 0,
            trans,
            root,
        }
    }

    /// Searches for a nonce satisfying the ledger's difficulty, checking
    /// after every attempt whether a peer's block has already advanced the
    /// chain out from under this candidate.
    async fn search(&self, mut block: Block) -> Option<Block> {
        self.is_mining.store(true, Ordering::SeqCst);
        info!(index = block.index, "mining started");
        let difficulty = self.full_node.ledger.difficulty();
        let mut rng = rand::thread_rng();
        let mut attempts: u64 = 0;

        let won = loop {
            if !self.is_mining.load(Ordering::SeqCst) {
                debug!(index = block.index, "mining preempted by chain change");
                break None;
            }
            block.nonce = rng.gen();
            let Ok(hash) = block.pow_hash() else {
                break None;
            };
            if chainlet_core::meets_difficulty(&hash, difficulty) {
                break Some(block);
            }
            attempts += 1;
            if attempts % 4096 == 0 {
                tokio::task::yield_now().await;
            }
        };

        self.is_mining.store(false, Ordering::SeqCst);
        won
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlet_p2p::Verbosity;
    use std::time::Duration;

    #[tokio::test]
    async fn mines_a_genesis_block_with_no_candidates() {
        let full_node = FullNode::bind("127.0.0.1", 0, None, 4, 1, Verbosity::Silent)
            .await
            .unwrap();
        full_node.start().await.unwrap();

        let keys = chainlet_crypto::KeyPair::generate();
        let miner = Miner::bind(full_node.clone(), keys.public_key_string(), 3).unwrap();
        miner.start();

        for _ in 0..200 {
            if full_node.ledger.height() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(full_node.ledger.height(), 1);
        miner.shutdown().await;
        full_node.shutdown().await;
    }
}
