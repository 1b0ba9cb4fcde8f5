use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-campus engines. Each campus gets its own Engine + WAL +
/// compactor; rooms on different campuses never share state.
/// Campus = database name from the pgwire connection.
pub struct CampusManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl CampusManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create an engine for the given campus.
    pub fn get_or_create(&self, campus: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(campus) {
            return Ok(engine.value().clone());
        }
        if campus.len() > MAX_CAMPUS_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "campus name too long",
            ));
        }
        if self.engines.len() >= MAX_CAMPUSES {
            return Err(std::io::Error::other("too many campuses"));
        }

        // Sanitize campus name to prevent path traversal
        let safe_name: String = campus
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty campus name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(campus.to_string(), engine.clone());
        metrics::gauge!(crate::observability::CAMPUSES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
