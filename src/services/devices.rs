//! Per-device calibration table

use crate::domain::types::DeviceConfig;
use rustc_hash::FxHashMap;

/// DeviceConfig entries keyed uniquely by id
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    by_id: FxHashMap<String, DeviceConfig>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list; later entries replace earlier ones with the same id
    pub fn from_configs(configs: impl IntoIterator<Item = DeviceConfig>) -> Self {
        let mut table = Self::new();
        for config in configs {
            table.upsert(config);
        }
        table
    }

    /// Insert or replace, returning the previous entry
    pub fn upsert(&mut self, config: DeviceConfig) -> Option<DeviceConfig> {
        self.by_id.insert(config.id.clone(), config)
    }

    pub fn remove(&mut self, id: &str) -> Option<DeviceConfig> {
        self.by_id.remove(id)
    }

    /// Lookup by id, falling back to an alias match
    pub fn find(&self, id: &str) -> Option<&DeviceConfig> {
        self.by_id
            .get(id)
            .or_else(|| self.by_id.values().find(|c| !c.alias.is_empty() && c.alias == id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, alias: &str) -> DeviceConfig {
        DeviceConfig { id: id.to_string(), alias: alias.to_string(), ..Default::default() }
    }

    #[test]
    fn test_find_by_id_then_alias() {
        let table = DeviceTable::from_configs([config("aabbcc", "phone"), config("112233", "")]);
        assert_eq!(table.find("aabbcc").unwrap().alias, "phone");
        assert_eq!(table.find("phone").unwrap().id, "aabbcc");
        assert!(table.find("").is_none());
        assert!(table.find("missing").is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let mut table = DeviceTable::new();
        assert!(table.upsert(config("a", "one")).is_none());
        let previous = table.upsert(config("a", "two")).unwrap();
        assert_eq!(previous.alias, "one");
        assert_eq!(table.len(), 1);
        assert_eq!(table.find("two").unwrap().id, "a");
        assert!(table.remove("a").is_some());
        assert!(table.is_empty());
    }
}
