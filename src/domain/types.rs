//! Shared types for advertisement intake and device calibration

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Current wall-clock time in epoch milliseconds (for event payloads)
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Milliseconds since process start, used for all presence timers
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must have 6 octets, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex octet {0:?}")]
    InvalidHex(String),
}

/// Bluetooth device address, most significant octet first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Lowercase hex without separators, the identifier form used for fingerprints
    pub fn to_id(&self) -> String {
        hex::encode(self.0)
    }

    /// Resolvable private addresses carry 0b01 in the two top bits
    #[inline]
    pub fn is_resolvable_private(&self) -> bool {
        self.0[0] >> 6 == 0b01
    }

    /// Random part of a resolvable private address
    #[inline]
    pub fn prand(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    /// Hash part of a resolvable private address
    #[inline]
    pub fn hash(&self) -> [u8; 3] {
        [self.0[3], self.0[4], self.0[5]]
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl std::str::FromStr for MacAddress {
    type Err = AddressError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let compact: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if compact.len() != 12 {
            let octets = if s.contains([':', '-']) {
                s.split([':', '-']).count()
            } else {
                compact.len() / 2
            };
            return Err(AddressError::InvalidLength(octets));
        }

        let mut bytes = [0u8; 6];
        hex::decode_to_slice(&compact, &mut bytes)
            .map_err(|_| AddressError::InvalidHex(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

/// One received advertisement as handed over by the radio stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    pub mac: MacAddress,
    pub rssi: i32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tx_power: Option<i32>,
    #[serde(default)]
    pub service_uuids: Vec<String>,
    /// Manufacturer specific data as hex
    #[serde(default)]
    pub manufacturer_data: Option<String>,
}

impl Advertisement {
    pub fn new(mac: MacAddress, rssi: i32) -> Self {
        Self {
            mac,
            rssi,
            name: None,
            tx_power: None,
            service_uuids: Vec::new(),
            manufacturer_data: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_service(mut self, uuid: &str) -> Self {
        self.service_uuids.push(uuid.to_string());
        self
    }

    pub fn with_manufacturer_data(mut self, data: &[u8]) -> Self {
        self.manufacturer_data = Some(hex::encode(data));
        self
    }

    pub fn with_tx_power(mut self, tx_power: i32) -> Self {
        self.tx_power = Some(tx_power);
        self
    }
}

/// Calibration override for one device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub name: String,
    /// RSSI expected at 1 meter; `None` falls back to the collection reference
    #[serde(default, rename = "calRssi", alias = "cal_rssi", alias = "rssi@1m")]
    pub cal_rssi: Option<i32>,
}

/// Body of a per-device configuration message; the id comes from the topic
#[derive(Debug, Deserialize)]
struct DeviceConfigPayload {
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "calRssi", alias = "rssi@1m")]
    cal_rssi: Option<i32>,
}

impl DeviceConfig {
    /// Parse a per-device JSON record, unknown fields ignored
    pub fn from_json(id: &str, json: &str) -> Result<Self, serde_json::Error> {
        let payload: DeviceConfigPayload = serde_json::from_str(json)?;
        Ok(Self {
            id: id.to_string(),
            alias: payload.alias.unwrap_or_default(),
            name: payload.name.unwrap_or_default(),
            cal_rssi: payload.cal_rssi,
        })
    }
}
