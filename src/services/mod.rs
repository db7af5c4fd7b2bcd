//! Services - presence engine and its building blocks
//!
//! Leaf first:
//! - `filter` - Adaptive low-pass filter for RSSI
//! - `distance` - RSSI to distance with outlier guard and range clamp
//! - `irk` - Resolvable private address matching
//! - `query` - Admission query language
//! - `devices` - Per-device calibration table
//! - `matcher` - Identity resolution and admission rules
//! - `tunables` - Runtime thresholds and the command surface
//! - `fingerprint` - Per-device presence state machine
//! - `collection` - Registry tying everything together

pub mod collection;
pub mod devices;
pub mod distance;
pub mod filter;
pub mod fingerprint;
pub mod irk;
pub mod matcher;
pub mod query;
pub mod tunables;

// Re-export commonly used types
pub use collection::{FingerprintCollection, FingerprintHandle, NoopListener, PresenceListener};
pub use fingerprint::{Fingerprint, FingerprintReport, Lifecycle, PresenceState};
pub use tunables::{CommandError, Tunables};
