//! Node: owns the hand-off queues and wires the engine thread to the
//! coordinator connection.

use std::any::Any;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::config::NodeConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::engine::EngineFactory;
use crate::error::{EngineError, Error, Result};
use crate::scheduler;

/// A single inference node. Independent instances share nothing.
pub struct Node {
    config: NodeConfig,
    engine: EngineFactory,
    state_tx: watch::Sender<ConnectionState>,
}

impl Node {
    pub fn new(config: NodeConfig, engine: EngineFactory) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            engine,
            state_tx,
        }
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Start the engine thread and serve the coordinator until the engine
    /// thread goes away. Engine init failure is returned immediately.
    pub async fn run(self) -> Result<()> {
        let url = self.config.connect_url()?;
        let capacity = self.config.queue_capacity;
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (session_tx, session_rx) = watch::channel(0);

        let engine_thread = scheduler::spawn_engine_thread(
            self.engine,
            inbound_rx,
            session_rx,
            outbound_tx,
            self.config.tick_interval,
        )
        .await?;
        info!(
            name = %self.config.name,
            model = %self.config.model_name(),
            max_concurrency = self.config.max_concurrency,
            "Engine ready"
        );

        let manager = ConnectionManager::new(
            url,
            &self.config,
            inbound_tx,
            outbound_rx,
            session_tx,
            self.state_tx,
        );
        let reason = manager.run().await;

        match tokio::task::spawn_blocking(move || engine_thread.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => {
                error!(panic = %panic_message(payload.as_ref()), "Engine thread panicked")
            }
            Err(e) => error!(error = %e, "Failed to join engine thread"),
        }
        info!(reason = %reason, "Node stopped");
        Err(Error::Engine(EngineError::ThreadExited))
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
