use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::domain::{DataType, DatasetCandidate, DatasetDescriptor, DatasetId};

/// Process-lifetime catalog of discovered datasets.
///
/// Entries live only in memory; persistence happens in the local cache
/// once a dataset is downloaded.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    entries: RwLock<BTreeMap<DatasetId, DatasetDescriptor>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a search hit under its deterministic id. Registering the
    /// same source and native id again overwrites the previous entry.
    pub fn register(&self, candidate: DatasetCandidate) -> DatasetId {
        self.insert(DatasetDescriptor::from(candidate))
    }

    pub fn insert(&self, descriptor: DatasetDescriptor) -> DatasetId {
        let id = descriptor.id.clone();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.insert(id.clone(), descriptor).is_some() {
            debug!(dataset = %id, "replaced registry entry");
        }
        id
    }

    pub fn lookup(&self, id: &DatasetId) -> Option<DatasetDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &DatasetId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Descriptors in id order, optionally filtered by species and data type.
    pub fn list(&self, species: Option<&str>, data_type: Option<DataType>) -> Vec<DatasetDescriptor> {
        let species = species.map(crate::domain::normalize_species);
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|descriptor| {
                species
                    .as_deref()
                    .map(|wanted| descriptor.species == wanted)
                    .unwrap_or(true)
            })
            .filter(|descriptor| data_type.map(|wanted| descriptor.data_type == wanted).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
