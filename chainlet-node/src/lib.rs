//! Wires the ledger, peer overlay and miner together into a single running
//! full node. `run_node` is the body of the `chainlet-node` binary's
//! `main`, kept in the library crate so it stays testable.

use anyhow::{Context, Result};
use chainlet_config::NodeArgs;
use chainlet_ledger::FullNode;
use chainlet_miner::Miner;
use chainlet_p2p::Verbosity;
use tracing::info;

pub async fn run_node(args: NodeArgs) -> Result<()> {
    let full_node = FullNode::bind(
        args.listen_host.clone(),
        args.listen_port,
        args.bootstrap(),
        args.max_nodes,
        args.difficulty,
        Verbosity::Summary,
    )
    .await
    .context("binding the peer overlay")?;

    full_node
        .start()
        .await
        .context("starting the peer overlay")?;
    info!(
        host = %full_node.node.host,
        port = full_node.node.port,
        "full node listening"
    );

    let miner = Miner::bind(full_node.clone(), args.pubkey.clone(), args.block_size)
        .context("deriving reward address from pubkey")?;
    miner.start();
    info!(pubkey = %args.pubkey, block_size = args.block_size, difficulty = args.difficulty, "mining started");

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    miner.shutdown().await;
    full_node.shutdown().await;
    Ok(())
}
