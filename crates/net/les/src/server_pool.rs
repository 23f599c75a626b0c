//! Ranking of light servers by the quality of their service.
//!
//! Every server carries a score in `[0, 1]` that moves towards `1` with fast successful
//! answers and towards `0` with failures and timeouts. Without fresh measurements the score
//! drifts back to [`NEUTRAL_SCORE`] with the configured half life. Scores survive restarts:
//! they are written to the database under a key derived from the network id and read back when
//! the pool is created. Servers that have not been seen for the retention period and whose
//! score has drifted back to neutral are forgotten when the pool is persisted.

use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use dos_interfaces::db::{DatabaseError, KeyValueStore};
use dos_metrics::SharedMetrics;
use dos_primitives::PeerId;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::metrics::LesMetrics;

/// Score of a server nothing is known about.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Weight of a single measurement in the score.
const SCORE_IMPACT: f64 = 0.2;

const SCORE_SCALE: f64 = 1_000_000.0;

/// Scores closer to neutral than this carry no information worth keeping.
const NEUTRAL_MARGIN: f64 = 0.01;

/// Settings of the [`ServerPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServerPoolConfig {
    /// Requests a new server serves before it is treated like any other.
    pub trial_requests: u32,
    /// Servers scoring below this no longer receive requests.
    pub score_floor: f64,
    /// Time in which a score loses half of its distance to the neutral score.
    pub decay_half_life: Duration,
    /// Outstanding requests allowed to a server that is still on trial.
    pub max_trial_in_flight: usize,
    /// How long a disconnected server with a neutral score is remembered.
    pub retention: Duration,
    /// Network the scores belong to.
    pub network_id: u64,
}

impl Default for ServerPoolConfig {
    fn default() -> Self {
        Self {
            trial_requests: 5,
            score_floor: 0.2,
            decay_half_life: Duration::from_secs(60 * 60),
            max_trial_in_flight: 1,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            network_id: 1,
        }
    }
}

/// Errors of the [`ServerPool`].
#[derive(Debug, Error)]
pub enum ServerPoolError {
    /// Reading or writing the persisted scores failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// What is persisted per server.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
struct ServerRecord {
    id: PeerId,
    score: u64,
    trials_left: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    served_cost: u64,
    updated_ms: u64,
    last_seen_ms: u64,
}

#[derive(Debug, Clone)]
struct ServerEntry {
    score: f64,
    /// When the score was last measured.
    updated_ms: u64,
    /// When the server was last connected or active.
    last_seen_ms: u64,
    trials_left: u32,
    in_flight: usize,
    connected: bool,
    latency: Option<Duration>,
    successes: u64,
    failures: u64,
    timeouts: u64,
    served_cost: u64,
}

impl ServerEntry {
    fn new(trials: u32, now_ms: u64) -> Self {
        Self {
            score: NEUTRAL_SCORE,
            updated_ms: now_ms,
            last_seen_ms: now_ms,
            trials_left: trials,
            in_flight: 0,
            connected: false,
            latency: None,
            successes: 0,
            failures: 0,
            timeouts: 0,
            served_cost: 0,
        }
    }

    fn from_record(record: &ServerRecord) -> Self {
        Self {
            score: (record.score as f64 / SCORE_SCALE).clamp(0.0, 1.0),
            updated_ms: record.updated_ms,
            last_seen_ms: record.last_seen_ms,
            trials_left: record.trials_left.min(u32::MAX as u64) as u32,
            in_flight: 0,
            connected: false,
            latency: None,
            successes: record.successes,
            failures: record.failures,
            timeouts: record.timeouts,
            served_cost: record.served_cost,
        }
    }

    fn to_record(&self, id: PeerId) -> ServerRecord {
        ServerRecord {
            id,
            score: (self.score * SCORE_SCALE) as u64,
            trials_left: self.trials_left as u64,
            successes: self.successes,
            failures: self.failures,
            timeouts: self.timeouts,
            served_cost: self.served_cost,
            updated_ms: self.updated_ms,
            last_seen_ms: self.last_seen_ms,
        }
    }

    /// The score as of `now_ms`, drifted towards neutral.
    fn decayed(&self, now_ms: u64, half_life: Duration) -> f64 {
        let elapsed = now_ms.saturating_sub(self.updated_ms) as f64 / 1000.0;
        let half_life = half_life.as_secs_f64();
        if half_life <= 0.0 {
            return self.score
        }
        NEUTRAL_SCORE + (self.score - NEUTRAL_SCORE) * 0.5f64.powf(elapsed / half_life)
    }

    /// Returns true if the entry is disconnected, long unseen and back to neutral.
    fn is_stale(&self, now_ms: u64, config: &ServerPoolConfig) -> bool {
        !self.connected &&
            now_ms.saturating_sub(self.last_seen_ms) >= config.retention.as_millis() as u64 &&
            (self.decayed(now_ms, config.decay_half_life) - NEUTRAL_SCORE).abs() < NEUTRAL_MARGIN
    }

    /// Folds a measurement with value `value` into the score.
    fn measure(&mut self, value: f64, now_ms: u64, half_life: Duration) {
        let score = self.decayed(now_ms, half_life);
        self.score = (score + SCORE_IMPACT * (value - score)).clamp(0.0, 1.0);
        self.updated_ms = now_ms;
        self.last_seen_ms = now_ms;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.trials_left = self.trials_left.saturating_sub(1);
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

/// Value of a successful answer that took `latency`.
fn success_value(latency: Duration) -> f64 {
    1.0 / (1.0 + latency.as_secs_f64())
}

fn storage_key(network_id: u64) -> Vec<u8> {
    let mut key = b"ServerPool-".to_vec();
    key.extend_from_slice(&network_id.to_be_bytes());
    key
}

/// Ranks light servers and decides which of them may receive requests.
///
/// A server whose score falls below the floor stays connected but is no longer eligible for new
/// assignments, its score recovers over time as it drifts back to neutral.
#[derive(Debug)]
pub struct ServerPool {
    config: ServerPoolConfig,
    db: Arc<dyn KeyValueStore>,
    entries: Mutex<HashMap<PeerId, ServerEntry>>,
    metrics: LesMetrics,
}

impl ServerPool {
    /// Creates the pool and loads the scores persisted for the configured network.
    ///
    /// Undecodable persisted data is discarded.
    pub fn new(
        config: ServerPoolConfig,
        db: Arc<dyn KeyValueStore>,
        metrics: SharedMetrics,
    ) -> Result<Self, ServerPoolError> {
        let mut entries = HashMap::new();
        if let Some(raw) = db.get(&storage_key(config.network_id))? {
            match Vec::<ServerRecord>::decode(&mut raw.as_slice()) {
                Ok(records) => {
                    for record in &records {
                        entries.insert(record.id, ServerEntry::from_record(record));
                    }
                }
                Err(error) => {
                    warn!(target: "les::serverpool", %error, "Discarding undecodable server scores");
                }
            }
        }
        debug!(target: "les::serverpool", network_id = config.network_id, known = entries.len(), "Loaded server pool");
        let metrics = LesMetrics::new(metrics);
        metrics.set_known_servers(entries.len());
        Ok(Self { config, db, entries: Mutex::new(entries), metrics })
    }

    /// The settings of the pool.
    pub fn config(&self) -> &ServerPoolConfig {
        &self.config
    }

    /// Marks the server connected, unknown servers start on trial with the neutral score.
    pub fn connect(&self, id: PeerId) {
        self.connect_at(id, now_ms())
    }

    fn connect_at(&self, id: PeerId, now_ms: u64) {
        let mut entries = self.entries.lock();
        let trials = self.config.trial_requests;
        let entry = entries.entry(id).or_insert_with(|| ServerEntry::new(trials, now_ms));
        entry.connected = true;
        entry.last_seen_ms = now_ms;
        entry.in_flight = 0;
        trace!(target: "les::serverpool", peer_id = %id, score = entry.score, "Server connected");
        self.metrics.set_known_servers(entries.len());
    }

    /// Marks the server disconnected, its score is kept.
    pub fn disconnect(&self, id: &PeerId) {
        self.disconnect_at(id, now_ms())
    }

    fn disconnect_at(&self, id: &PeerId, now_ms: u64) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.connected = false;
            entry.last_seen_ms = now_ms;
            entry.in_flight = 0;
            trace!(target: "les::serverpool", peer_id = %id, "Server disconnected");
        }
    }

    /// A request was assigned to the server.
    pub(crate) fn on_assign(&self, id: &PeerId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.in_flight += 1;
        }
    }

    /// A request assigned to the server ended without an answer to judge the server by.
    pub(crate) fn settle(&self, id: &PeerId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// The server answered correctly after `latency`.
    pub fn record_success(&self, id: &PeerId, latency: Duration) {
        self.record_success_at(id, latency, now_ms())
    }

    fn record_success_at(&self, id: &PeerId, latency: Duration, now_ms: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else { return };
        let on_trial = entry.trials_left > 0;
        entry.measure(success_value(latency), now_ms, self.config.decay_half_life);
        entry.successes += 1;
        entry.latency = Some(match entry.latency {
            Some(previous) => previous.mul_f64(1.0 - SCORE_IMPACT) + latency.mul_f64(SCORE_IMPACT),
            None => latency,
        });
        if on_trial && entry.trials_left == 0 {
            debug!(target: "les::serverpool", peer_id = %id, score = entry.score, "Server promoted");
        }
    }

    /// The server answered with invalid data.
    pub fn record_failure(&self, id: &PeerId) {
        self.record_failure_at(id, now_ms())
    }

    fn record_failure_at(&self, id: &PeerId, now_ms: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else { return };
        entry.measure(0.0, now_ms, self.config.decay_half_life);
        entry.failures += 1;
        self.log_floor(id, entry);
    }

    /// The server did not answer in time.
    pub fn record_timeout(&self, id: &PeerId) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else { return };
        entry.measure(0.0, now_ms(), self.config.decay_half_life);
        entry.timeouts += 1;
        self.log_floor(id, entry);
    }

    /// Adds the cost the server charged for an answer.
    pub fn record_served_cost(&self, id: &PeerId, cost: u64) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.served_cost = entry.served_cost.saturating_add(cost);
        }
    }

    fn log_floor(&self, id: &PeerId, entry: &ServerEntry) {
        if entry.score < self.config.score_floor {
            debug!(target: "les::serverpool", peer_id = %id, score = entry.score, "Server fell below score floor");
        }
    }

    /// Returns true if the server may receive a new request.
    ///
    /// Servers the pool never saw are eligible.
    pub fn is_eligible(&self, id: &PeerId) -> bool {
        self.is_eligible_at(id, now_ms())
    }

    fn is_eligible_at(&self, id: &PeerId, now_ms: u64) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(id) else { return true };
        if entry.decayed(now_ms, self.config.decay_half_life) < self.config.score_floor {
            return false
        }
        entry.trials_left == 0 || entry.in_flight < self.config.max_trial_in_flight
    }

    /// Returns true if the score of the server is not below the floor, regardless of its
    /// outstanding trial requests.
    pub fn meets_floor(&self, id: &PeerId) -> bool {
        let now = now_ms();
        self.entries.lock().get(id).map_or(true, |entry| {
            entry.decayed(now, self.config.decay_half_life) >= self.config.score_floor
        })
    }

    /// The current score of the server.
    pub fn score(&self, id: &PeerId) -> Option<f64> {
        let now = now_ms();
        self.entries.lock().get(id).map(|entry| entry.decayed(now, self.config.decay_half_life))
    }

    /// Returns true if the server is still on trial.
    pub fn on_trial(&self, id: &PeerId) -> bool {
        self.entries.lock().get(id).map_or(true, |entry| entry.trials_left > 0)
    }

    /// Returns true if the server is currently connected.
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.entries.lock().get(id).map_or(false, |entry| entry.connected)
    }

    /// Smoothed answer latency of the server.
    pub fn latency(&self, id: &PeerId) -> Option<Duration> {
        self.entries.lock().get(id).and_then(|entry| entry.latency)
    }

    /// Total cost the server charged.
    pub fn served_cost(&self, id: &PeerId) -> u64 {
        self.entries.lock().get(id).map_or(0, |entry| entry.served_cost)
    }

    /// All servers the pool knows, best score first.
    pub fn known_servers(&self) -> Vec<(PeerId, f64)> {
        let now = now_ms();
        let mut servers: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.decayed(now, self.config.decay_half_life)))
            .collect();
        servers.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        servers
    }

    /// When the server was last connected or active, in milliseconds since the unix epoch.
    pub fn last_seen(&self, id: &PeerId) -> Option<u64> {
        self.entries.lock().get(id).map(|entry| entry.last_seen_ms)
    }

    /// Forgets stale servers and writes the scores of the remaining ones to the database.
    pub fn persist(&self) -> Result<(), ServerPoolError> {
        self.persist_at(now_ms())
    }

    fn persist_at(&self, now_ms: u64) -> Result<(), ServerPoolError> {
        let (records, pruned) = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_stale(now_ms, &self.config));
            self.metrics.set_known_servers(entries.len());
            let records: Vec<ServerRecord> =
                entries.iter().map(|(id, entry)| entry.to_record(*id)).collect();
            (records, before - entries.len())
        };
        self.db.put(&storage_key(self.config.network_id), &alloy_rlp::encode(&records))?;
        debug!(target: "les::serverpool", servers = records.len(), pruned, "Persisted server scores");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dos_interfaces::db::MemoryDatabase;

    fn pool(db: &Arc<MemoryDatabase>, config: ServerPoolConfig) -> ServerPool {
        ServerPool::new(config, db.clone(), dos_metrics::noop()).unwrap()
    }

    #[test]
    fn new_servers_start_neutral_on_trial() {
        let db = Arc::new(MemoryDatabase::new());
        let pool = pool(&db, ServerPoolConfig::default());
        let id = PeerId::repeat_byte(1);
        pool.connect(id);
        assert_eq!(pool.score(&id), Some(NEUTRAL_SCORE));
        assert!(pool.on_trial(&id));

        // a single outstanding request while on trial
        assert!(pool.is_eligible(&id));
        pool.on_assign(&id);
        assert!(!pool.is_eligible(&id));
        pool.record_success(&id, Duration::from_millis(100));
        assert!(pool.is_eligible(&id));
        assert!(pool.score(&id).unwrap() > NEUTRAL_SCORE);

        for _ in 0..4 {
            pool.on_assign(&id);
            pool.record_success(&id, Duration::from_millis(100));
        }
        assert!(!pool.on_trial(&id));
        pool.on_assign(&id);
        pool.on_assign(&id);
        assert!(pool.is_eligible(&id));
    }

    #[test]
    fn failing_server_drops_below_floor_and_recovers() {
        let db = Arc::new(MemoryDatabase::new());
        let pool = pool(&db, ServerPoolConfig::default());
        let id = PeerId::repeat_byte(1);
        pool.connect(id);

        let now = now_ms();
        for _ in 0..5 {
            pool.record_failure_at(&id, now);
        }
        assert!(pool.score(&id).unwrap() < 0.2);
        assert!(!pool.is_eligible_at(&id, now));

        // two half lives later the score is back above the floor
        let later = now + 2 * 60 * 60 * 1000;
        assert!(pool.is_eligible_at(&id, later));
    }

    #[test]
    fn slow_answers_score_lower() {
        let db = Arc::new(MemoryDatabase::new());
        let pool = pool(&db, ServerPoolConfig::default());
        let (fast, slow) = (PeerId::repeat_byte(1), PeerId::repeat_byte(2));
        pool.connect(fast);
        pool.connect(slow);
        let now = now_ms();
        pool.record_success_at(&fast, Duration::from_millis(50), now);
        pool.record_success_at(&slow, Duration::from_secs(3), now);
        pool.record_served_cost(&fast, 10);
        pool.record_served_cost(&fast, 5);

        assert_eq!(pool.known_servers().first().map(|(id, _)| *id), Some(fast));
        assert!(pool.score(&slow).unwrap() < NEUTRAL_SCORE);
        assert_eq!(pool.served_cost(&fast), 15);
        assert_eq!(pool.latency(&slow), Some(Duration::from_secs(3)));
    }

    #[test]
    fn scores_survive_restart_per_network() {
        let db = Arc::new(MemoryDatabase::new());
        let (good, bad) = (PeerId::repeat_byte(1), PeerId::repeat_byte(2));
        {
            let pool = pool(&db, ServerPoolConfig::default());
            pool.connect(good);
            pool.connect(bad);
            for _ in 0..5 {
                pool.record_success(&good, Duration::from_millis(10));
                pool.record_timeout(&bad);
            }
            pool.disconnect(&good);
            assert!(!pool.is_connected(&good));
            pool.persist().unwrap();
        }

        let pool = pool(&db, ServerPoolConfig::default());
        let known = pool.known_servers();
        assert_eq!(known.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![good, bad]);
        assert!(!pool.on_trial(&good));
        assert!(!pool.is_eligible(&bad));

        let other = pool_for_network(&db, 5);
        assert!(other.known_servers().is_empty());
    }

    fn pool_for_network(db: &Arc<MemoryDatabase>, network_id: u64) -> ServerPool {
        pool(db, ServerPoolConfig { network_id, ..Default::default() })
    }

    #[test]
    fn stale_neutral_servers_are_forgotten() {
        let db = Arc::new(MemoryDatabase::new());
        let config = ServerPoolConfig::default();
        let day = 24 * 60 * 60 * 1000;
        let (idle, failing, online) =
            (PeerId::repeat_byte(1), PeerId::repeat_byte(2), PeerId::repeat_byte(3));
        let pool = pool(&db, config.clone());
        let start = now_ms() - 30 * day;
        for id in [idle, failing, online] {
            pool.connect_at(id, start);
        }
        for _ in 0..5 {
            pool.record_failure_at(&failing, start + 29 * day);
        }
        pool.disconnect_at(&idle, start + day);
        pool.disconnect_at(&failing, start + 29 * day);
        assert_eq!(pool.last_seen(&idle), Some(start + day));
        assert_eq!(pool.last_seen(&failing), Some(start + 29 * day));

        // only the neutral server unseen for longer than the retention is dropped
        pool.persist_at(start + 30 * day).unwrap();
        let known: Vec<_> = pool.known_servers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(known, vec![online, failing]);

        let reloaded = pool_for_network(&db, config.network_id);
        assert_eq!(reloaded.last_seen(&failing), Some(start + 29 * day));
        assert_eq!(reloaded.last_seen(&idle), None);
        assert!(!reloaded.is_connected(&online));
    }

    #[test]
    fn garbage_in_database_is_ignored() {
        let db = Arc::new(MemoryDatabase::new());
        db.put(&storage_key(1), b"\xff\x00garbage").unwrap();
        let pool = pool(&db, ServerPoolConfig::default());
        assert!(pool.known_servers().is_empty());
    }
}
