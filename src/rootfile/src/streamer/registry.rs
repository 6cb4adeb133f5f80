use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::streamer::StreamerInfo;

/// StreamerRegistry maps a class name and version to its layout.
///
/// Each open file owns one registry, populated from the file's streamer
/// record and from the layouts of records written through it.
#[derive(Default)]
pub struct StreamerRegistry {
    infos: RwLock<HashMap<String, BTreeMap<i16, Arc<StreamerInfo>>>>,
}

impl StreamerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register adds a layout. Registering an identical layout again is a
    /// no-op; a different layout under an existing (class, version) is refused
    /// since stored objects may already reference it.
    pub fn register(&self, info: StreamerInfo) -> Result<Arc<StreamerInfo>> {
        let mut infos = self.infos.write();
        let versions = infos.entry(info.class.clone()).or_default();
        if let Some(existing) = versions.get(&info.version) {
            if existing.same_layout(&info) {
                return Ok(existing.clone());
            }
            return Err(Error::corrupted(format!(
                "conflicting layouts for class {:?} version {}",
                info.class, info.version
            )));
        }

        let info = Arc::new(info);
        versions.insert(info.version, info.clone());
        Ok(info)
    }

    pub fn get(&self, class: &str, version: i16) -> Option<Arc<StreamerInfo>> {
        self.infos.read().get(class)?.get(&version).cloned()
    }

    pub fn latest(&self, class: &str) -> Option<Arc<StreamerInfo>> {
        self.infos
            .read()
            .get(class)?
            .values()
            .next_back()
            .cloned()
    }

    pub fn contains_class(&self, class: &str) -> bool {
        self.infos.read().contains_key(class)
    }

    /// lookup resolves the layout used to decode `class` written at `version`:
    /// the exact version, else the highest known version below it (trailing
    /// fields are skipped by byte count), else the lowest version above it.
    pub fn lookup(&self, class: &str, version: i16) -> Result<Arc<StreamerInfo>> {
        let infos = self.infos.read();
        let versions = infos.get(class).ok_or_else(|| Error::SchemaNotFound {
            class: class.to_string(),
            version,
        })?;

        if let Some(info) = versions.get(&version) {
            return Ok(info.clone());
        }

        let fallback = versions
            .range(..version)
            .next_back()
            .or_else(|| versions.range(version..).next())
            .map(|(_, info)| info.clone());
        match fallback {
            Some(info) => {
                tracing::warn!(
                    "no layout for {} v{}, decoding with v{}",
                    class,
                    version,
                    info.version
                );
                Ok(info)
            }
            None => Err(Error::SchemaNotFound {
                class: class.to_string(),
                version,
            }),
        }
    }

    /// infos returns every registered layout ordered by class then version.
    pub fn infos(&self) -> Vec<Arc<StreamerInfo>> {
        let infos = self.infos.read();
        let mut classes: Vec<_> = infos.keys().collect();
        classes.sort();
        classes
            .into_iter()
            .flat_map(|c| infos[c].values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.infos.read().values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
