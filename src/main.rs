use anyhow::Context;

use inference_node::config::NodeConfig;
use inference_node::engine::{EchoEngine, Engine, EngineFactory};
use inference_node::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = NodeConfig::from_env().context("Invalid node configuration")?;

    eprintln!("inference-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Node: {}", config.name);
    eprintln!("   Model: {}", config.model_name());
    eprintln!("   Coordinator: {}", config.server);

    let model_path = config.model_path.clone();
    let engine: EngineFactory = Box::new(move || {
        EchoEngine::init(&model_path).map(|engine| Box::new(engine) as Box<dyn Engine>)
    });

    Node::new(config, engine)
        .run()
        .await
        .context("Node stopped")
}
