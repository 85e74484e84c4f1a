use chainlet_config::{init_logging, NodeArgs};
use clap::Parser;
use tracing::Level;

#[tokio::main]
async fn main() {
    init_logging(Level::INFO);
    let args = NodeArgs::parse();
    if let Err(error) = chainlet_node::run_node(args).await {
        eprintln!("node failed: {error:?}");
        std::process::exit(1);
    }
}
