//! The lock/unlock stack language. A single opcode, `CHECKSIG`, is
//! supported: pop a public key and a signature off the stack, verify the
//! signature over the payload, push `"true"` or `"false"`.

use chainlet_core::Transaction;
use serde::Serialize;

/// Concatenates `unlock` then `lock` tokens onto a stack and evaluates them
/// against `prior_tx` (the transaction whose output is being spent, with
/// its own `hash` field removed -- see [`Transaction::signing_body`]).
/// Returns the top of the stack after every token runs.
pub fn execute(unlock: &str, lock: &str, prior_tx: &Transaction) -> String {
    let mut stack: Vec<String> = unlock.split_whitespace().map(str::to_string).collect();

    for token in lock.split_whitespace() {
        if token == "CHECKSIG" {
            let pubkey = stack.pop().unwrap_or_default();
            let signature = stack.pop().unwrap_or_default();
            let ok = chainlet_crypto::verify(&pubkey, &signature, &body(prior_tx));
            stack.push(if ok { "true" } else { "false" }.to_string());
        } else {
            stack.push(token.to_string());
        }
    }

    stack.last().cloned().unwrap_or_default()
}

fn body(tx: &Transaction) -> impl Serialize + '_ {
    tx.signing_body()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlet_core::{TxOutput, Transaction as Tx};

    #[test]
    fn checksig_accepts_a_valid_signature() {
        let keypair = chainlet_crypto::KeyPair::generate();
        let prior = Tx::new(
            vec![],
            vec![TxOutput {
                address: keypair.address(),
                value: 10,
                lock: format!("{} CHECKSIG", keypair.public_key_string()),
            }],
        );
        let signature = keypair.sign(&prior.signing_body()).unwrap();
        let lock = &prior.output[0].lock;
        assert_eq!(execute(&signature, lock, &prior), "true");
    }

    #[test]
    fn checksig_rejects_a_wrong_key() {
        let owner = chainlet_crypto::KeyPair::generate();
        let attacker = chainlet_crypto::KeyPair::generate();
        let prior = Tx::new(
            vec![],
            vec![TxOutput {
                address: owner.address(),
                value: 10,
                lock: format!("{} CHECKSIG", owner.public_key_string()),
            }],
        );
        let signature = attacker.sign(&prior.signing_body()).unwrap();
        let lock = &prior.output[0].lock;
        assert_eq!(execute(&signature, lock, &prior), "false");
    }

    #[test]
    fn unknown_opcode_is_pushed_literally() {
        let prior = Tx::empty();
        assert_eq!(execute("42", "", &prior), "42");
    }
}
