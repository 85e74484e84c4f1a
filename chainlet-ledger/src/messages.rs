//! The `request`-tagged bodies carried inside `BROADCAST`/`PRIVATE` packets.
//! Shared between the ledger engine and the wallet, since both speak this
//! protocol.

use chainlet_core::{Address, Block, Digest, Transaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request")]
pub enum BroadcastRequest {
    #[serde(rename = "TRANSACT")]
    Transact { tx: Transaction },
    #[serde(rename = "SUBMIT_BLOCK")]
    SubmitBlock { block: Block },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request")]
pub enum PrivateRequest {
    #[serde(rename = "GET_BLOCKS")]
    GetBlocks,
    #[serde(rename = "LIST_BLOCKS")]
    ListBlocks { blocks: Vec<Block> },
    #[serde(rename = "GET_BALANCE")]
    GetBalance { address: Address },
    #[serde(rename = "BALANCE")]
    Balance {
        address: Address,
        utxo: Vec<Transaction>,
    },
    #[serde(rename = "GET_PROOF")]
    GetProof { txid: Digest },
    #[serde(rename = "PROOF")]
    Proof {
        txid: Digest,
        index: u64,
        proof: Vec<Digest>,
    },
}
