//! Configuration files.
use dos_downloaders::{downloader::DownloaderConfig, handler::ChainSyncerConfig};
use dos_les::{DistributorConfig, RetrieveConfig, ServerPoolConfig};
use dos_primitives::SyncMode;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Errors of loading or checking a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read, written or parsed.
    #[error(transparent)]
    Load(#[from] confy::ConfyError),
    /// The config could not be rendered as TOML.
    #[error(transparent)]
    Render(#[from] toml::ser::Error),
    /// A size that must be positive is zero.
    #[error("{0} must not be zero")]
    Zero(&'static str),
    /// Bloom sections must hold a whole number of bytes.
    #[error("bloom section size {0} is not a multiple of 8")]
    BloomSectionSize(u64),
    /// Score floors are fractions.
    #[error("score floor {0} is outside of [0, 1]")]
    ScoreFloor(f64),
}

/// Configuration for the dos node.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Chain synchronisation.
    pub sync: SyncConfig,
    /// Propagated block retrieval.
    pub fetcher: FetcherConfig,
    /// On-demand retrieval from light servers.
    pub les: LesConfig,
    /// Chain indexers.
    pub indexer: IndexerConfig,
}

impl Config {
    /// Loads the config from the TOML file, writing the defaults if it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = confy::load_path(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config to the TOML file.
    pub fn store(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        Ok(confy::store_path(path, self)?)
    }

    /// The config as TOML document.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("sync.skeleton_size", self.sync.skeleton_size),
            ("sync.fill_batch", self.sync.fill_batch),
            ("sync.max_block_fetch", self.sync.max_block_fetch as u64),
            ("sync.max_receipt_fetch", self.sync.max_receipt_fetch as u64),
            ("sync.max_state_fetch", self.sync.max_state_fetch as u64),
            ("indexer.bloom_section_size", self.indexer.bloom_section_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name))
        }
        if self.indexer.bloom_section_size % 8 != 0 {
            return Err(ConfigError::BloomSectionSize(self.indexer.bloom_section_size))
        }
        let floor = self.les.server_pool.score_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::ScoreFloor(floor))
        }
        Ok(())
    }
}

/// Chain synchronisation configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Mode of the first synchronisation.
    pub mode: SyncMode,
    /// Number of skeleton headers requested at once.
    pub skeleton_size: u64,
    /// Distance between skeleton headers.
    pub fill_batch: u64,
    /// Upper bound of bodies in one request.
    pub max_block_fetch: usize,
    /// Upper bound of receipt lists in one request.
    pub max_receipt_fetch: usize,
    /// Upper bound of state nodes in one request.
    pub max_state_fetch: usize,
    /// Round trip time requests are sized for.
    #[serde(with = "humantime_serde")]
    pub request_ttl: Duration,
    /// Time after which an unanswered request expires.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Expired requests after which a peer is dropped from a run.
    pub peer_timeout_limit: usize,
    /// Upper bound of downloaded blocks waiting to be committed.
    pub max_buffered_blocks: usize,
    /// Distance of the fast sync pivot from the head.
    pub pivot_distance: u64,
    /// Maximum depth of the common ancestor below the local head.
    pub max_fork_ancestry: u64,
    /// Interval after which a synchronisation is attempted even with few peers.
    #[serde(with = "humantime_serde")]
    pub force_sync_interval: Duration,
    /// Number of connected peers that triggers a synchronisation.
    pub min_sync_peers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let downloader = DownloaderConfig::default();
        let syncer = ChainSyncerConfig::default();
        Self {
            mode: syncer.mode,
            skeleton_size: downloader.skeleton_size,
            fill_batch: downloader.fill_batch,
            max_block_fetch: downloader.max_block_fetch,
            max_receipt_fetch: downloader.max_receipt_fetch,
            max_state_fetch: downloader.max_state_fetch,
            request_ttl: downloader.request_ttl,
            request_timeout: downloader.request_timeout,
            peer_timeout_limit: downloader.peer_timeout_limit,
            max_buffered_blocks: downloader.max_buffered_blocks,
            pivot_distance: downloader.pivot_distance,
            max_fork_ancestry: downloader.max_fork_ancestry,
            force_sync_interval: syncer.force_sync_interval,
            min_sync_peers: syncer.min_sync_peers,
        }
    }
}

impl From<&SyncConfig> for DownloaderConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            skeleton_size: config.skeleton_size,
            fill_batch: config.fill_batch,
            max_block_fetch: config.max_block_fetch,
            max_receipt_fetch: config.max_receipt_fetch,
            max_state_fetch: config.max_state_fetch,
            request_ttl: config.request_ttl,
            request_timeout: config.request_timeout,
            peer_timeout_limit: config.peer_timeout_limit,
            max_buffered_blocks: config.max_buffered_blocks,
            pivot_distance: config.pivot_distance,
            max_fork_ancestry: config.max_fork_ancestry,
        }
    }
}

impl From<&SyncConfig> for ChainSyncerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            mode: config.mode,
            force_sync_interval: config.force_sync_interval,
            min_sync_peers: config.min_sync_peers,
        }
    }
}

/// Propagated block retrieval configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Time allowed for an announced block to arrive.
    #[serde(with = "humantime_serde")]
    pub arrive_timeout: Duration,
    /// Interval used to collate almost-expired announces with fetches.
    #[serde(with = "humantime_serde")]
    pub gather_slack: Duration,
    /// Time allowed for a header or body request to be answered.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Maximum depth of an imported block below the head.
    pub max_uncle_dist: u64,
    /// Maximum height of a queued block above the head.
    pub max_queue_dist: u64,
    /// Maximum number of unfetched announcements per peer.
    pub hash_limit: usize,
    /// Maximum number of queued blocks per peer.
    pub block_limit: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        dos_downloaders::fetcher::FetcherConfig::default().into()
    }
}

impl From<dos_downloaders::fetcher::FetcherConfig> for FetcherConfig {
    fn from(config: dos_downloaders::fetcher::FetcherConfig) -> Self {
        Self {
            arrive_timeout: config.arrive_timeout,
            gather_slack: config.gather_slack,
            fetch_timeout: config.fetch_timeout,
            max_uncle_dist: config.max_uncle_dist,
            max_queue_dist: config.max_queue_dist,
            hash_limit: config.hash_limit,
            block_limit: config.block_limit,
        }
    }
}

impl From<&FetcherConfig> for dos_downloaders::fetcher::FetcherConfig {
    fn from(config: &FetcherConfig) -> Self {
        Self {
            arrive_timeout: config.arrive_timeout,
            gather_slack: config.gather_slack,
            fetch_timeout: config.fetch_timeout,
            max_uncle_dist: config.max_uncle_dist,
            max_queue_dist: config.max_queue_dist,
            hash_limit: config.hash_limit,
            block_limit: config.block_limit,
        }
    }
}

/// Light client configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LesConfig {
    /// Network the server scores belong to.
    pub network_id: u64,
    /// Request distribution.
    pub distributor: DistributorSettings,
    /// Retrieval retries.
    pub retrieve: RetrieveSettings,
    /// Server scoring.
    pub server_pool: ServerPoolSettings,
}

impl Default for LesConfig {
    fn default() -> Self {
        Self {
            network_id: ServerPoolConfig::default().network_id,
            distributor: DistributorSettings::default(),
            retrieve: RetrieveSettings::default(),
            server_pool: ServerPoolSettings::default(),
        }
    }
}

impl LesConfig {
    /// Settings of the request distributor.
    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig { wait_timeout: self.distributor.wait_timeout }
    }

    /// Settings of the retrieve manager.
    pub fn retrieve_config(&self) -> RetrieveConfig {
        RetrieveConfig { request_timeout: self.retrieve.request_timeout, deadline: self.retrieve.deadline }
    }

    /// Settings of the server pool.
    pub fn server_pool_config(&self) -> ServerPoolConfig {
        ServerPoolConfig {
            trial_requests: self.server_pool.trial_requests,
            score_floor: self.server_pool.score_floor,
            decay_half_life: self.server_pool.decay_half_life,
            max_trial_in_flight: self.server_pool.max_trial_in_flight,
            retention: self.server_pool.retention,
            network_id: self.network_id,
        }
    }
}

/// Request distribution configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct DistributorSettings {
    /// How long a request may wait for a server.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Default for DistributorSettings {
    fn default() -> Self {
        Self { wait_timeout: DistributorConfig::default().wait_timeout }
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct RetrieveSettings {
    /// How long a single server gets to answer.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long a retrieval may take across all attempts.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
}

impl Default for RetrieveSettings {
    fn default() -> Self {
        let config = RetrieveConfig::default();
        Self { request_timeout: config.request_timeout, deadline: config.deadline }
    }
}

/// Server scoring configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ServerPoolSettings {
    /// Requests a new server serves before it is treated like any other.
    pub trial_requests: u32,
    /// Servers scoring below this no longer receive requests.
    pub score_floor: f64,
    /// Time in which a score loses half of its distance to the neutral score.
    #[serde(with = "humantime_serde")]
    pub decay_half_life: Duration,
    /// Outstanding requests allowed to a server on trial.
    pub max_trial_in_flight: usize,
    /// How long a disconnected server with a neutral score is remembered.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for ServerPoolSettings {
    fn default() -> Self {
        let config = ServerPoolConfig::default();
        Self {
            trial_requests: config.trial_requests,
            score_floor: config.score_floor,
            decay_half_life: config.decay_half_life,
            max_trial_in_flight: config.max_trial_in_flight,
            retention: config.retention,
        }
    }
}

/// Chain indexer configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Blocks per bloom bits section.
    pub bloom_section_size: u64,
    /// Confirmations before a bloom bits section is processed.
    pub bloom_confirms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { bloom_section_size: 4096, bloom_confirms: 256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENSION: &str = "toml";

    fn with_tempdir(filename: &str, proc: fn(&std::path::Path)) {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(filename).with_extension(EXTENSION);

        proc(&config_path);

        temp_dir.close().unwrap()
    }

    #[test]
    fn test_store_config() {
        with_tempdir("config-store-test", |config_path| {
            Config::default().store(config_path).unwrap();
        })
    }

    #[test]
    fn test_load_config() {
        with_tempdir("config-load-test", |config_path| {
            let config = Config::default();
            config.store(config_path).unwrap();

            let loaded_config = Config::load(config_path).unwrap();
            assert_eq!(config, loaded_config);
        })
    }

    #[test]
    fn test_missing_file_gets_defaults() {
        with_tempdir("config-missing-test", |config_path| {
            assert_eq!(Config::load(config_path).unwrap(), Config::default());
            assert!(config_path.exists());
        })
    }

    #[test]
    fn test_partial_config() {
        with_tempdir("config-partial-test", |config_path| {
            std::fs::write(
                config_path,
                "[sync]\nmode = \"full\"\nrequest_ttl = \"5s\"\n\n[les.retrieve]\ndeadline = \"1m\"\n",
            )
            .unwrap();
            let config = Config::load(config_path).unwrap();
            assert_eq!(config.sync.mode, SyncMode::Full);
            assert_eq!(config.sync.request_ttl, Duration::from_secs(5));
            assert_eq!(config.sync.skeleton_size, 128);
            assert_eq!(config.les.retrieve.deadline, Duration::from_secs(60));
            assert_eq!(config.les.retrieve.request_timeout, Duration::from_secs(2));
            assert_eq!(config.indexer, IndexerConfig::default());
        })
    }

    #[test]
    fn test_invalid_config() {
        with_tempdir("config-invalid-test", |config_path| {
            std::fs::write(config_path, "[indexer]\nbloom_section_size = 100\n").unwrap();
            assert!(matches!(Config::load(config_path), Err(ConfigError::BloomSectionSize(100))));
        })
    }

    #[test]
    fn defaults_match_components() {
        let config = Config::default();
        assert_eq!(DownloaderConfig::from(&config.sync), DownloaderConfig::default());
        assert_eq!(ChainSyncerConfig::from(&config.sync), ChainSyncerConfig::default());
        assert_eq!(
            dos_downloaders::fetcher::FetcherConfig::from(&config.fetcher),
            dos_downloaders::fetcher::FetcherConfig::default()
        );
        assert_eq!(config.les.distributor_config(), DistributorConfig::default());
        assert_eq!(config.les.retrieve_config(), RetrieveConfig::default());
        assert_eq!(config.les.server_pool_config(), ServerPoolConfig::default());
    }

    #[test]
    fn rendered_toml_uses_readable_durations() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("request_ttl = \"3s\""));
        assert!(rendered.contains("decay_half_life = \"1h\""));
        assert!(rendered.contains("retention = \"7days\""));
        assert!(rendered.contains("[les.server_pool]"));
    }
}
