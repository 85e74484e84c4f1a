//! Interactive wallet shell: reads commands from stdin in a loop, mirroring
//! the source CLI's command set plus the spec's address-book and
//! header-proof extensions.

use std::io::{self, Write};
use std::path::Path;

use chainlet_config::{init_logging, WalletArgs};
use chainlet_wallet::Wallet;
use clap::Parser;
use tracing::Level;

const HELP: &str = "\
help                         show this message
update_balance               refresh the UTXO cache from the connected node
get_balance                  print the cached balance
register <name> <pubkey>     remember a pubkey under a short name
transfer <pubkey|name> <v>   send v to a pubkey or registered name
transfer                     broadcast an empty transaction (wakes mining)
sync_block                   refresh the header cache from the connected node
block_count                  print the number of cached headers
get_proof <txid>             fetch a Merkle proof for txid
verify_proof [<txid>]        verify the most recently fetched proof(s)
exit                         quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(Level::WARN);
    let args = WalletArgs::parse();

    let wallet_file = match args.wallet_file {
        Some(path) => path,
        None => prompt_for_wallet_file()?,
    };

    let keys = if Path::new(&wallet_file).exists() {
        chainlet_wallet::load_wallet_file(&wallet_file)?
    } else {
        chainlet_wallet::save_wallet_file(&wallet_file)?
    };
    println!("Address: {}", keys.address());
    println!("Public Key: {}", keys.public_key_string());

    let wallet = Wallet::bind(
        keys,
        args.listen_host,
        args.listen_port,
        args.remote_host,
        args.remote_port,
    )
    .await?;
    wallet.start().await?;

    let mut last_txid: Option<String> = None;
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        line.clear();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["help"] => println!("{HELP}"),
            ["get_balance"] => println!("{} BTC", wallet.get_balance()),
            ["update_balance"] => {
                println!("SYNC");
                wallet.update_balance().await;
            }
            ["register", name, pubkey] => {
                wallet.register(name, pubkey);
                println!("SUCCESS");
            }
            ["transfer"] => {
                wallet.empty_transfer().await;
                println!("SUCCESS");
            }
            ["transfer", target, value] => match value.parse::<u64>() {
                Ok(value) => {
                    let pubkey = wallet.resolve_pubkey(target);
                    match wallet.transfer(&pubkey, value).await {
                        Some(txid) => {
                            last_txid = Some(txid);
                            println!("SUCCESS");
                        }
                        None => println!("FAILURE"),
                    }
                }
                Err(_) => println!("ERROR"),
            },
            ["sync_block"] => {
                println!("SYNC");
                wallet.sync_block().await;
            }
            ["block_count"] => println!("{}", wallet.block_count()),
            ["get_proof", txid] => {
                wallet.get_proof(txid).await;
                last_txid = Some(txid.to_string());
                println!("SYNC");
            }
            ["verify_proof"] => match &last_txid {
                Some(txid) if wallet.verify_proof(txid) => println!("VALID"),
                Some(_) => println!("INVALID"),
                None => println!("ERROR"),
            },
            ["verify_proof", txid] => {
                if wallet.verify_proof(txid) {
                    println!("VALID");
                } else {
                    println!("INVALID");
                }
            }
            ["exit"] => {
                wallet.shutdown().await;
                break;
            }
            _ => println!("ERROR"),
        }
    }

    Ok(())
}

fn prompt_for_wallet_file() -> anyhow::Result<String> {
    print!("Do you already have a wallet (Y/n) ? ");
    io::stdout().flush().ok();
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;

    print!("Choose a file name: ");
    io::stdout().flush().ok();
    let mut path = String::new();
    io::stdin().read_line(&mut path)?;
    Ok(path.trim().to_string())
}
