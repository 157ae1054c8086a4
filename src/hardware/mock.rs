//! Mock Hardware Implementations
//!
//! Provides simulated collaborators for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockInstrument` - Instrument with a fixed settings snapshot and a read counter
//! - `MockStageMover` - Stage mover that remembers visited devices, optionally failing
//! - `MockPeakSearcher` - Peak search that returns a fixed optimum

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::device::{Chip, Device};
use crate::hardware::{Instrument, PeakSearcher, StageMover};

// =============================================================================
// MockInstrument
// =============================================================================

/// Instrument with a fixed settings map.
///
/// Every snapshot increments a counter and reports it as `snapshot count`, so tests
/// can tell the before and after snapshots of a record apart.
pub struct MockInstrument {
    name: String,
    settings: Map<String, Value>,
    snapshots: AtomicUsize,
}

impl MockInstrument {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            settings: Map::new(),
            snapshots: AtomicUsize::new(0),
        }
    }

    pub fn with_setting(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

impl Instrument for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Value {
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        let mut snap = self.settings.clone();
        snap.insert("name".into(), Value::String(self.name.clone()));
        snap.insert("snapshot count".into(), json!(n));
        Value::Object(snap)
    }
}

// =============================================================================
// MockStageMover
// =============================================================================

/// Stage mover with a 5ms simulated move.
///
/// # Example
///
/// ```rust,ignore
/// let mover = MockStageMover::new();
/// mover.move_to_device(&chip, &device).await?;
/// assert_eq!(mover.visited().await, vec!["D1".to_string()]);
/// ```
#[derive(Default)]
pub struct MockStageMover {
    visited: Arc<RwLock<Vec<String>>>,
    fail_on: Option<String>,
}

impl MockStageMover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail whenever asked to move to the device with this id.
    pub fn failing_on(device_id: &str) -> Self {
        Self {
            visited: Arc::default(),
            fail_on: Some(device_id.to_string()),
        }
    }

    /// Ids of the devices moved to, in order.
    pub async fn visited(&self) -> Vec<String> {
        self.visited.read().await.clone()
    }
}

#[async_trait]
impl StageMover for MockStageMover {
    async fn move_to_device(&self, _chip: &Chip, device: &Device) -> Result<()> {
        if self.fail_on.as_deref() == Some(device.id.as_str()) {
            return Err(anyhow!("stage limit reached moving to device {}", device.id));
        }
        sleep(Duration::from_millis(5)).await;
        self.visited.write().await.push(device.id.clone());
        Ok(())
    }
}

// =============================================================================
// MockPeakSearcher
// =============================================================================

/// Peak searcher that always reports the same optimum.
pub struct MockPeakSearcher {
    optimum_dbm: f64,
    searches: AtomicUsize,
}

impl MockPeakSearcher {
    pub fn new(optimum_dbm: f64) -> Self {
        Self {
            optimum_dbm,
            searches: AtomicUsize::new(0),
        }
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeakSearcher for MockPeakSearcher {
    async fn search_for_peak(&self) -> Result<Value> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "optimized power [dBm]": self.optimum_dbm,
            "x [um]": 0.0,
            "y [um]": 0.0,
        }))
    }
}
