//! Domain models - core data types shared by every layer
//!
//! - `Advertisement` - one received radio advertisement
//! - `MacAddress` - device address with resolvable-private helpers
//! - `DeviceConfig` - per-device calibration override

pub mod types;

pub use types::{epoch_ms, monotonic_ms, AddressError, Advertisement, DeviceConfig, MacAddress};
