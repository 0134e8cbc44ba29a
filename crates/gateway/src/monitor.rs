//! Latest monitoring sample per session.
//!
//! Only the most recent sample is kept. Entries are removed when monitoring
//! stops or the session closes, so a late sample cannot resurrect one.

use std::sync::Arc;

use dashmap::DashMap;
use protocol::messages::MonitoringSample;

/// Shared store of the last sample received for each monitored session.
#[derive(Debug, Clone, Default)]
pub struct MonitorHub {
    latest: Arc<DashMap<String, MonitoringSample>>,
}

impl MonitorHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored sample for `session_id`.
    pub fn update(&self, session_id: &str, sample: MonitoringSample) {
        self.latest.insert(session_id.to_string(), sample);
    }

    pub fn latest(&self, session_id: &str) -> Option<MonitoringSample> {
        self.latest.get(session_id).map(|entry| *entry)
    }

    pub fn remove(&self, session_id: &str) -> Option<MonitoringSample> {
        self.latest.remove(session_id).map(|(_, sample)| sample)
    }

    /// Number of sessions with a stored sample.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
