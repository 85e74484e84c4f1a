//! The ledger engine: block and transaction validation, chain extension,
//! UTXO bookkeeping, and the wire dispatch that installs all of it onto a
//! peer-overlay [`chainlet_p2p::Node`].

mod full_node;
mod ledger;
mod messages;
mod script;

pub use full_node::{FullNode, TransactHook};
pub use ledger::{Ledger, COINBASE_REWARD};
pub use messages::{BroadcastRequest, PrivateRequest};
pub use script::execute as run_script;
