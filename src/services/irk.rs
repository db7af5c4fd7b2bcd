//! Resolvable private address matching against known identity keys
//!
//! Implements the Bluetooth `ah` hash: AES-128 of the 24-bit `prand`
//! zero-padded to a block, truncated to its low 24 bits and compared with
//! the hash half of the address. Keys are given as 32 hex characters, most
//! significant octet first.

use crate::domain::types::MacAddress;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrkError {
    #[error("identity key must be 32 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("identity key is not valid hex")]
    InvalidHex,
}

/// One identity resolving key with its expanded cipher
#[derive(Clone)]
pub struct Irk {
    key: [u8; 16],
    cipher: Aes128,
}

impl std::fmt::Debug for Irk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Irk").field("id", &self.id()).finish()
    }
}

impl PartialEq for Irk {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Irk {
    pub fn new(key: [u8; 16]) -> Self {
        let cipher = Aes128::new(&GenericArray::from(key));
        Self { key, cipher }
    }

    /// Stable identifier for devices resolved through this key
    pub fn id(&self) -> String {
        format!("irk:{}", hex::encode(self.key))
    }

    /// Random address hash function `ah(k, r)`
    pub fn ah(&self, prand: [u8; 3]) -> [u8; 3] {
        let mut block = [0u8; 16];
        block[13..].copy_from_slice(&prand);
        let mut block = GenericArray::from(block);
        self.cipher.encrypt_block(&mut block);
        [block[13], block[14], block[15]]
    }

    pub fn resolves(&self, mac: &MacAddress) -> bool {
        mac.is_resolvable_private() && self.ah(mac.prand()) == mac.hash()
    }
}

impl std::str::FromStr for Irk {
    type Err = IrkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 32 {
            return Err(IrkError::InvalidLength(s.len()));
        }
        let mut key = [0u8; 16];
        hex::decode_to_slice(s, &mut key).map_err(|_| IrkError::InvalidHex)?;
        Ok(Self::new(key))
    }
}

/// Compiled `known_irks` list
#[derive(Debug, Clone, Default)]
pub struct IrkSet {
    keys: Vec<Irk>,
}

impl IrkSet {
    /// Parse a whitespace or comma separated list of keys
    pub fn parse(list: &str) -> Result<Self, IrkError> {
        let keys = list
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Irk>, _>>()?;
        Ok(Self { keys })
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// First key that resolves the address
    pub fn resolve(&self, mac: &MacAddress) -> Option<&Irk> {
        if !mac.is_resolvable_private() {
            return None;
        }
        self.keys.iter().find(|irk| irk.resolves(mac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sample data from the Bluetooth core specification (ah function)
    const SAMPLE_IRK: &str = "ec0234a357c8ad05341010a60a397d9b";

    #[test]
    fn test_ah_sample_vector() {
        let irk: Irk = SAMPLE_IRK.parse().unwrap();
        assert_eq!(irk.ah([0x70, 0x81, 0x94]), [0x0d, 0xfb, 0xaa]);
    }

    #[test]
    fn test_resolves_sample_address() {
        let irk: Irk = SAMPLE_IRK.parse().unwrap();
        let mac: MacAddress = "70:81:94:0d:fb:aa".parse().unwrap();
        assert!(irk.resolves(&mac));

        let other: MacAddress = "70:81:94:0d:fb:ab".parse().unwrap();
        assert!(!irk.resolves(&other));
    }

    #[test]
    fn test_resolves_generated_address() {
        let irk = Irk::new([7u8; 16]);
        let prand = [0x5a, 0x12, 0x34];
        let hash = irk.ah(prand);
        let mac = MacAddress([prand[0], prand[1], prand[2], hash[0], hash[1], hash[2]]);
        assert!(irk.resolves(&mac));
    }

    #[test]
    fn test_irk_set_parse() {
        let set = IrkSet::parse(&format!("{SAMPLE_IRK}, {}", "00".repeat(16))).unwrap();
        assert_eq!(set.len(), 2);
        let mac: MacAddress = "70:81:94:0d:fb:aa".parse().unwrap();
        assert_eq!(set.resolve(&mac).unwrap().id(), format!("irk:{SAMPLE_IRK}"));

        assert!(IrkSet::parse("").unwrap().is_empty());
        assert_eq!(IrkSet::parse("abcd").unwrap_err(), IrkError::InvalidLength(4));
        assert_eq!(IrkSet::parse(&"zz".repeat(16)).unwrap_err(), IrkError::InvalidHex);
    }

    #[test]
    fn test_public_address_never_resolves() {
        let set = IrkSet::parse(SAMPLE_IRK).unwrap();
        let mac: MacAddress = "f0:81:94:0d:fb:aa".parse().unwrap();
        assert!(set.resolve(&mac).is_none());
    }
}
