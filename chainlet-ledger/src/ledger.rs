//! The ledger engine proper: block/transaction validation, chain extension,
//! the per-address UTXO index and the candidate transaction buffer. Mutable
//! state lives behind a single mutex, matching the source's one lock
//! guarding the ledger, the UTXO index and the candidate buffer together.

use std::collections::{HashMap, HashSet};

use chainlet_core::{Address, Block, Digest, MerkleTree, Transaction};
use parking_lot::Mutex;

use crate::script;

/// The fixed block subsidy a coinbase output may not exceed.
pub const COINBASE_REWARD: u64 = 50;

struct LedgerState {
    blocks: Vec<Block>,
    utxo: HashMap<Address, HashSet<Transaction>>,
    candidates: HashSet<Transaction>,
    tx_index: HashMap<Digest, (usize, usize)>,
}

/// Validates blocks and transactions, extends the chain, and tracks unspent
/// outputs per address. One engine is shared by the overlay dispatch, the
/// mining loop, and private-message handlers.
pub struct Ledger {
    difficulty: usize,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new(difficulty: usize) -> Self {
        assert!(difficulty > 0, "difficulty must be positive");
        Ledger {
            difficulty,
            state: Mutex::new(LedgerState {
                blocks: Vec::new(),
                utxo: HashMap::new(),
                candidates: HashSet::new(),
                tx_index: HashMap::new(),
            }),
        }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn height(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().candidates.len()
    }

    /// The whole chain, for `GET_BLOCKS`/`LIST_BLOCKS` replies.
    pub fn blocks(&self) -> Vec<Block> {
        self.state.lock().blocks.clone()
    }

    pub fn last_hash(&self) -> Option<Digest> {
        let state = self.state.lock();
        state.blocks.last().map(|b| b.pow_hash().unwrap_or_default())
    }

    /// Inserts a transaction received via a `TRANSACT` broadcast into the
    /// candidate buffer. Deduplicated by structural equality (the tx hash).
    pub fn insert_candidate(&self, tx: Transaction) {
        self.state.lock().candidates.insert(tx);
    }

    /// The unspent outputs known to belong to `address`, for a `BALANCE`
    /// reply.
    pub fn utxo_for(&self, address: &str) -> Vec<Transaction> {
        self.state
            .lock()
            .utxo
            .get(address)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Locates the transaction by hash, scanning the ledger via the
    /// hash-to-position index maintained alongside the UTXO index.
    pub fn find_tx(&self, hash: &str) -> Option<Transaction> {
        let state = self.state.lock();
        let (block_idx, tx_idx) = *state.tx_index.get(hash)?;
        state.blocks.get(block_idx)?.trans.get(tx_idx).cloned()
    }

    /// Builds a Merkle inclusion proof for `txid`, for a `GET_PROOF` reply.
    /// Returns the containing block's index alongside the proof.
    pub fn proof_for(&self, txid: &str) -> Option<(u64, Vec<Digest>)> {
        let state = self.state.lock();
        let (block_idx, _) = *state.tx_index.get(txid)?;
        let block = state.blocks.get(block_idx)?;
        let hashes: Vec<Digest> = block.trans.iter().map(|tx| tx.hash.clone()).collect();
        let tree = MerkleTree::build(hashes)?;
        let proof = tree.proof(txid).ok()?;
        Some((block.index, proof))
    }

    /// Validates a non-coinbase, non-empty transaction against the current
    /// UTXO index: every input resolves to a still-unspent output whose lock
    /// script is satisfied by the input's unlock argument, and input value
    /// equals output value with distinct output addresses.
    pub fn check_tx(&self, tx: &Transaction) -> bool {
        let state = self.state.lock();
        self.check_tx_locked(&state, tx)
    }

    fn check_tx_locked(&self, state: &LedgerState, tx: &Transaction) -> bool {
        if tx.is_empty_transfer() {
            return true;
        }

        let mut input_value: u64 = 0;
        for input in &tx.input {
            let Some(prior) = self.find_tx_locked(state, &input.prev_tx_hash) else {
                return false;
            };
            let Some(utxo) = prior.output.get(input.index as usize) else {
                return false;
            };
            let still_unspent = state
                .utxo
                .get(&utxo.address)
                .map(|set| set.contains(&prior))
                .unwrap_or(false);
            if !still_unspent {
                return false;
            }
            if script::execute(&input.unlock, &utxo.lock, &prior) != "true" {
                return false;
            }
            input_value = input_value.saturating_add(utxo.value);
        }

        let output_value: u64 = tx.output.iter().map(|o| o.value).sum();
        let unique_addresses: HashSet<&str> =
            tx.output.iter().map(|o| o.address.as_str()).collect();

        input_value == output_value && unique_addresses.len() == tx.output.len()
    }

    fn find_tx_locked(&self, state: &LedgerState, hash: &str) -> Option<Transaction> {
        let (block_idx, tx_idx) = *state.tx_index.get(hash)?;
        state.blocks.get(block_idx)?.trans.get(tx_idx).cloned()
    }

    /// Checks a block's shape, proof-of-work, and (optionally) its
    /// contained transactions. `check_tx` is skipped for blocks just
    /// received via broadcast, since the referenced UTXO state may not
    /// match yet on this node.
    pub fn check_block(&self, block: &Block, check_tx: bool) -> bool {
        let Ok(hash) = block.pow_hash() else {
            return false;
        };
        if !chainlet_core::meets_difficulty(&hash, self.difficulty) {
            return false;
        }
        if block.coinbase_count() > 1 {
            return false;
        }

        for tx in &block.trans {
            if tx.is_coinbase() {
                if tx.output[0].value > COINBASE_REWARD {
                    return false;
                }
            } else if check_tx && !self.check_tx(tx) {
                return false;
            }
        }
        true
    }

    /// Does `block` extend the current chain tip? An empty ledger accepts
    /// any genesis block.
    pub fn check_chain(&self, block: &Block) -> bool {
        let state = self.state.lock();
        match state.blocks.last() {
            None => true,
            Some(last) => last.pow_hash().ok().as_deref() == block.hash.as_deref(),
        }
    }

    /// Re-validates `block`, verifies chain linkage, appends it, patches the
    /// UTXO index, and evicts its transactions from the candidate buffer.
    pub fn add_block(&self, block: Block) -> bool {
        if !self.check_block(&block, true) || !self.check_chain(&block) {
            return false;
        }

        let mut state = self.state.lock();
        let block_idx = state.blocks.len();

        for (tx_idx, tx) in block.trans.iter().enumerate() {
            for input in &tx.input {
                if let Some((pb, pt)) = state.tx_index.get(&input.prev_tx_hash).copied() {
                    if let Some(prior) = state.blocks.get(pb).and_then(|b| b.trans.get(pt)) {
                        if let Some(utxo) = prior.output.get(input.index as usize) {
                            let address = utxo.address.clone();
                            let prior = prior.clone();
                            if let Some(set) = state.utxo.get_mut(&address) {
                                set.remove(&prior);
                            }
                        }
                    }
                }
            }
            state.tx_index.insert(tx.hash.clone(), (block_idx, tx_idx));
        }

        for tx in &block.trans {
            for output in &tx.output {
                state
                    .utxo
                    .entry(output.address.clone())
                    .or_default()
                    .insert(tx.clone());
            }
        }

        let spent: HashSet<Transaction> = block.trans.iter().cloned().collect();
        state.candidates.retain(|tx| !spent.contains(tx));

        state.blocks.push(block);
        true
    }

    /// Replaces the whole chain with `blocks`, used when catching up via
    /// `LIST_BLOCKS`. Every transaction in the discarded chain is returned
    /// to the candidate buffer first; only proof-of-work is re-checked on
    /// the genesis block, and `add_block` runs for every subsequent one,
    /// stopping at the first rejection.
    pub fn replace_with(&self, mut blocks: Vec<Block>) -> bool {
        if blocks.is_empty() {
            return false;
        }

        {
            let mut state = self.state.lock();
            let freed: Vec<Transaction> = state
                .blocks
                .iter()
                .flat_map(|b| b.trans.iter().cloned())
                .collect();
            state.candidates.extend(freed);

            let genesis = blocks.remove(0);
            if !self.check_block(&genesis, false) {
                return false;
            }
            state.blocks.clear();
            state.utxo.clear();
            state.tx_index.clear();
            state.blocks.push(genesis.clone());
            for (tx_idx, tx) in genesis.trans.iter().enumerate() {
                state.tx_index.insert(tx.hash.clone(), (0, tx_idx));
                for output in &tx.output {
                    state
                        .utxo
                        .entry(output.address.clone())
                        .or_default()
                        .insert(tx.clone());
                }
            }
            state.candidates.retain(|tx| !genesis.trans.contains(tx));
        }

        for block in blocks {
            if !self.add_block(block) {
                return false;
            }
        }
        true
    }

    /// Pops up to `limit` candidate transactions, validates each against
    /// the current UTXO state, evicts the invalid ones from the buffer
    /// permanently, and returns the survivors (still present in the
    /// buffer -- they are only removed once a block containing them is
    /// accepted).
    pub fn sample_valid_candidates(&self, limit: usize) -> Vec<Transaction> {
        let mut state = self.state.lock();
        let sample: Vec<Transaction> = state.candidates.iter().take(limit).cloned().collect();
        let mut valid = Vec::with_capacity(sample.len());
        for tx in sample {
            if self.check_tx_locked(&state, &tx) {
                valid.push(tx);
            } else {
                state.candidates.remove(&tx);
            }
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlet_core::TxOutput;

    fn mine(ledger: &Ledger, mut block: Block) -> Block {
        loop {
            let hash = block.pow_hash().unwrap();
            if chainlet_core::meets_difficulty(&hash, ledger.difficulty()) {
                return block;
            }
            block.nonce += 1;
        }
    }

    #[test]
    fn genesis_block_accepted_on_empty_ledger() {
        let ledger = Ledger::new(1);
        let block = mine(
            &ledger,
            Block {
                index: 0,
                hash: None,
                nonce: 0,
                trans: vec![Transaction::empty()],
                root: None,
            },
        );
        assert!(ledger.add_block(block));
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn coinbase_above_reward_is_rejected() {
        let ledger = Ledger::new(1);
        let coinbase = Transaction::new(
            vec![],
            vec![TxOutput {
                address: "miner".to_string(),
                value: 51,
                lock: "miner CHECKSIG".to_string(),
            }],
        );
        let block = mine(
            &ledger,
            Block {
                index: 0,
                hash: None,
                nonce: 0,
                trans: vec![coinbase],
                root: None,
            },
        );
        assert!(!ledger.add_block(block));
    }

    #[test]
    fn spend_and_change_round_trip() {
        let ledger = Ledger::new(1);
        let keypair = chainlet_crypto::KeyPair::generate();
        let coinbase = Transaction::new(
            vec![],
            vec![TxOutput {
                address: keypair.address(),
                value: 50,
                lock: format!("{} CHECKSIG", keypair.public_key_string()),
            }],
        );
        let coinbase_hash = coinbase.hash.clone();
        let genesis = mine(
            &ledger,
            Block {
                index: 0,
                hash: None,
                nonce: 0,
                trans: vec![coinbase],
                root: None,
            },
        );
        assert!(ledger.add_block(genesis));

        let prior = ledger.find_tx(&coinbase_hash).unwrap();
        let signature = keypair.sign(&prior.signing_body()).unwrap();
        let spend = Transaction::new(
            vec![chainlet_core::TxInput {
                prev_tx_hash: coinbase_hash,
                index: 0,
                unlock: signature,
            }],
            vec![TxOutput {
                address: "bob".to_string(),
                value: 10,
                lock: "bob CHECKSIG".to_string(),
            }, TxOutput {
                address: keypair.address(),
                value: 40,
                lock: format!("{} CHECKSIG", keypair.public_key_string()),
            }],
        );

        assert!(ledger.check_tx(&spend));

        let next = mine(
            &ledger,
            Block {
                index: 1,
                hash: ledger.last_hash(),
                nonce: 0,
                trans: vec![spend],
                root: None,
            },
        );
        assert!(ledger.add_block(next));
        assert_eq!(ledger.utxo_for("bob").len(), 1);
        assert_eq!(ledger.utxo_for(&keypair.address()).len(), 1);
    }
}
