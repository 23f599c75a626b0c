//! Main node command
//!
//! Starts the node and runs it until ctrl-c or a critical task fails.
use crate::node::{dev_genesis, NoExecution, Node, NodeComponents};
use clap::{Parser, ValueEnum};
use dos_config::Config;
use dos_interfaces::{db::MemoryDatabase, p2p::peer::NoopReporter};
use dos_metrics::RecorderMetrics;
use dos_primitives::{EngineKind, SyncMode};
use dos_tasks::TaskManager;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

/// Consensus engine families selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// Proof-of-work.
    Pow,
    /// Proof-of-authority.
    Poa,
}

impl From<Engine> for EngineKind {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Pow => Self::ProofOfWork,
            Engine::Poa => Self::ProofOfAuthority,
        }
    }
}

/// Start the node
#[derive(Debug, Parser)]
pub struct Command {
    /// The path to the configuration file to use.
    ///
    /// The file is created with the defaults if it does not exist.
    #[arg(long, value_name = "FILE", verbatim_doc_comment)]
    config: Option<PathBuf>,

    /// Overrides the sync mode of the configuration: full, fast, light or lightonly.
    #[arg(long = "sync.mode", value_name = "MODE")]
    sync_mode: Option<SyncMode>,

    /// Overrides the network id of the configuration.
    #[arg(long = "network.id", value_name = "ID")]
    network_id: Option<u64>,

    /// The consensus engine headers are verified with.
    #[arg(long, value_enum, default_value_t = Engine::Pow)]
    engine: Engine,
}

impl Command {
    fn load_config(&self) -> eyre::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(mode) = self.sync_mode {
            config.sync.mode = mode;
        }
        if let Some(network_id) = self.network_id {
            config.les.network_id = network_id;
        }
        Ok(config)
    }

    /// Execute `node` command
    pub async fn execute(self) -> eyre::Result<()> {
        let config = self.load_config()?;
        info!(target: "dos::cli", mode = %config.sync.mode, engine = ?self.engine, "Starting dos");

        let manager = TaskManager::current();
        let tasks = manager.executor();
        let components = NodeComponents {
            db: Arc::new(MemoryDatabase::new()),
            genesis: dev_genesis(),
            engine: self.engine.into(),
            executor: Arc::new(NoExecution),
            reporter: Arc::new(NoopReporter::default()),
            metrics: Arc::new(RecorderMetrics::default()),
        };
        let node = Node::launch(&config, components, &tasks)?;

        let shutdown = tasks.clone();
        tasks.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "dos::cli", "Received ctrl-c, shutting down");
                shutdown.initiate_graceful_shutdown();
            }
        });

        let result = manager.wait().await;
        node.shutdown()?;
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_overrides() {
        let command = Command::try_parse_from([
            "node",
            "--sync.mode",
            "light",
            "--network.id",
            "5",
            "--engine",
            "poa",
        ])
        .unwrap();
        let config = command.load_config().unwrap();
        assert_eq!(config.sync.mode, SyncMode::Light);
        assert_eq!(config.les.network_id, 5);
        assert_eq!(EngineKind::from(command.engine), EngineKind::ProofOfAuthority);
    }

    #[test]
    fn rejects_unknown_sync_mode() {
        assert!(Command::try_parse_from(["node", "--sync.mode", "turbo"]).is_err());
    }

    #[test]
    fn loads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dos.toml");
        std::fs::write(&path, "[les]\nnetwork_id = 7\n").unwrap();
        let command =
            Command::try_parse_from(["node", "--config", path.to_str().unwrap()]).unwrap();
        assert_eq!(command.load_config().unwrap().les.network_id, 7);
    }
}
