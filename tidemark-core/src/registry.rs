//! Dataset registry.
//!
//! Binds datasets (named groups of schemas) to the providers that can supply
//! them, and owns the pool of open storage namespaces. A `Registry` is a plain
//! value: tests build as many isolated registries as they like, and every
//! recorder takes one by reference at construction.
//!
//! Namespaces are opened lazily, once per (provider, dataset), and shared as
//! `Arc<Store>` by every recorder built from the same registry. The pool lives
//! exactly as long as the registry.

use crate::catalog::{EntityCatalog, META_DATASET};
use crate::domain::{EntityType, Level};
use crate::schema::{Schema, SchemaError};
use crate::storage::{NamespaceKey, StorageRoot, Store, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("dataset '{0}' is not registered")]
    UnknownDataset(String),

    #[error("provider '{provider}' is not registered for dataset '{dataset}'")]
    ProviderNotBound { provider: String, dataset: String },

    #[error("table '{table}' of dataset '{dataset}' is already declared with a different layout")]
    IncompatibleSchema { dataset: String, table: String },

    #[error("dataset '{dataset}': {source}")]
    InvalidSchema {
        dataset: String,
        #[source]
        source: SchemaError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Declarative dataset definition, as found in run files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub providers: Vec<String>,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub schemas: Vec<Schema>,
}

#[derive(Debug, Clone, Default)]
struct DatasetEntry {
    entity_type: Option<EntityType>,
    schemas: Vec<Schema>,
}

pub struct Registry {
    root: StorageRoot,
    datasets: BTreeMap<String, DatasetEntry>,
    provider_datasets: BTreeMap<String, BTreeSet<String>>,
    by_type_level: HashMap<(String, EntityType, Level), String>,
    pool: Mutex<HashMap<NamespaceKey, Arc<Store>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.root)
            .field("datasets", &self.datasets.keys().collect::<Vec<_>>())
            .field("providers", &self.provider_datasets)
            .finish()
    }
}

impl Registry {
    pub fn new(root: StorageRoot) -> Self {
        Self {
            root,
            datasets: BTreeMap::new(),
            provider_datasets: BTreeMap::new(),
            by_type_level: HashMap::new(),
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Registry whose namespaces are private in-memory databases.
    pub fn in_memory() -> Self {
        Self::new(StorageRoot::Memory)
    }

    pub fn root(&self) -> &StorageRoot {
        &self.root
    }

    /// Declare `dataset` with `schemas` and bind it to `providers`.
    ///
    /// Opens each provider's namespace and creates tables and indices that do
    /// not exist yet. Registering the same definition again is a no-op;
    /// adding new schemas to a known dataset extends it. A table whose layout
    /// differs from an earlier declaration (in this registry or on disk) is
    /// rejected.
    pub fn register(
        &mut self,
        providers: &[&str],
        dataset: &str,
        schemas: Vec<Schema>,
        entity_type: Option<EntityType>,
    ) -> Result<(), RegistryError> {
        for schema in &schemas {
            schema.validate().map_err(|source| RegistryError::InvalidSchema {
                dataset: dataset.to_string(),
                source,
            })?;
        }

        let entry = self.datasets.get(dataset);
        let mut added = Vec::new();
        for schema in schemas {
            let existing = entry.and_then(|e| e.schemas.iter().find(|s| s.table == schema.table));
            match existing {
                Some(known) if known.fingerprint() != schema.fingerprint() => {
                    return Err(RegistryError::IncompatibleSchema {
                        dataset: dataset.to_string(),
                        table: schema.table,
                    });
                }
                Some(_) => {}
                None => {
                    if !added.iter().any(|s: &Schema| s.table == schema.table) {
                        added.push(schema);
                    }
                }
            }
        }

        let mut all_schemas: Vec<Schema> = entry.map(|e| e.schemas.clone()).unwrap_or_default();
        all_schemas.extend(added);

        // check every namespace before creating any table, so a rejected
        // layout leaves the registry and every namespace's tables as they were
        let mut stores = Vec::with_capacity(providers.len());
        for provider in providers {
            let store = self.open_namespace(NamespaceKey::new(*provider, dataset))?;
            for schema in &all_schemas {
                store
                    .check_compatible(schema)
                    .map_err(|e| schema_conflict(dataset, e))?;
            }
            stores.push(store);
        }
        for store in &stores {
            for schema in &all_schemas {
                store
                    .ensure_table(schema)
                    .map_err(|e| schema_conflict(dataset, e))?;
            }
        }

        for schema in &all_schemas {
            self.by_type_level
                .entry((dataset.to_string(), schema.entity_type.clone(), schema.level))
                .or_insert_with(|| schema.table.clone());
        }
        let entry = self.datasets.entry(dataset.to_string()).or_default();
        if entity_type.is_some() {
            entry.entity_type = entity_type;
        }
        entry.schemas = all_schemas;
        for provider in providers {
            self.provider_datasets
                .entry(provider.to_string())
                .or_default()
                .insert(dataset.to_string());
        }

        tracing::info!(
            dataset,
            providers = ?providers,
            tables = self.datasets[dataset].schemas.len(),
            "dataset registered"
        );
        Ok(())
    }

    pub fn register_spec(&mut self, spec: &DatasetSpec) -> Result<(), RegistryError> {
        let providers: Vec<&str> = spec.providers.iter().map(String::as_str).collect();
        self.register(
            &providers,
            &spec.name,
            spec.schemas.clone(),
            spec.entity_type.clone(),
        )
    }

    pub fn is_registered(&self, provider: &str, dataset: &str) -> bool {
        self.provider_datasets
            .get(provider)
            .is_some_and(|d| d.contains(dataset))
    }

    /// Shared store of a registered (provider, dataset) pair.
    pub fn store(&self, provider: &str, dataset: &str) -> Result<Arc<Store>, RegistryError> {
        if !self.datasets.contains_key(dataset) {
            return Err(RegistryError::UnknownDataset(dataset.to_string()));
        }
        if !self.is_registered(provider, dataset) {
            return Err(RegistryError::ProviderNotBound {
                provider: provider.to_string(),
                dataset: dataset.to_string(),
            });
        }
        self.open_namespace(NamespaceKey::new(provider, dataset))
    }

    /// Entity catalog of `entity_provider`, kept in its `meta` namespace.
    pub fn catalog(&self, entity_provider: &str) -> Result<EntityCatalog, RegistryError> {
        let store = self.open_namespace(NamespaceKey::new(entity_provider, META_DATASET))?;
        Ok(EntityCatalog::open(store)?)
    }

    pub fn datasets_for(&self, provider: &str) -> Vec<&str> {
        self.provider_datasets
            .get(provider)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn providers_for(&self, dataset: &str) -> Vec<&str> {
        self.provider_datasets
            .iter()
            .filter(|(_, datasets)| datasets.contains(dataset))
            .map(|(p, _)| p.as_str())
            .collect()
    }

    pub fn schemas_of(&self, dataset: &str) -> Option<&[Schema]> {
        self.datasets.get(dataset).map(|e| e.schemas.as_slice())
    }

    pub fn entity_type_of(&self, dataset: &str) -> Option<&EntityType> {
        self.datasets.get(dataset).and_then(|e| e.entity_type.as_ref())
    }

    pub fn find_schema(&self, dataset: &str, table: &str) -> Option<&Schema> {
        self.schemas_of(dataset)?.iter().find(|s| s.table == table)
    }

    /// Schema of `dataset` for an entity type at a level.
    pub fn schema_for(&self, dataset: &str, entity_type: &EntityType, level: Level) -> Option<&Schema> {
        let table = self
            .by_type_level
            .get(&(dataset.to_string(), entity_type.clone(), level))?;
        self.find_schema(dataset, table)
    }

    /// Every registered (provider, dataset) pair, sorted.
    pub fn namespaces(&self) -> Vec<NamespaceKey> {
        self.provider_datasets
            .iter()
            .flat_map(|(p, datasets)| datasets.iter().map(move |d| NamespaceKey::new(p.as_str(), d.as_str())))
            .collect()
    }

    fn open_namespace(&self, key: NamespaceKey) -> Result<Arc<Store>, RegistryError> {
        let mut pool = self.pool.lock();
        if let Some(store) = pool.get(&key) {
            return Ok(store.clone());
        }
        let store = Arc::new(Store::open(&self.root, key.clone())?);
        tracing::debug!(namespace = %key, "namespace opened");
        pool.insert(key, store.clone());
        Ok(store)
    }
}

fn schema_conflict(dataset: &str, e: StoreError) -> RegistryError {
    match e {
        StoreError::IncompatibleSchema { table, .. } => RegistryError::IncompatibleSchema {
            dataset: dataset.to_string(),
            table,
        },
        other => RegistryError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn kdata() -> Schema {
        Schema::kdata("stock", Level::Day1)
    }

    #[test]
    fn register_binds_providers_and_datasets() {
        let mut reg = Registry::in_memory();
        reg.register(&["sina", "netease"], "stock_1d_kdata", vec![kdata()], Some("stock".into()))
            .unwrap();

        assert!(reg.is_registered("sina", "stock_1d_kdata"));
        assert!(!reg.is_registered("eastmoney", "stock_1d_kdata"));
        assert_eq!(reg.datasets_for("sina"), vec!["stock_1d_kdata"]);
        assert_eq!(reg.providers_for("stock_1d_kdata"), vec!["netease", "sina"]);
        assert_eq!(reg.namespaces().len(), 2);
        assert_eq!(reg.entity_type_of("stock_1d_kdata"), Some(&EntityType::from("stock")));
    }

    #[test]
    fn register_is_idempotent() {
        let mut reg = Registry::in_memory();
        reg.register(&["sina"], "stock_1d_kdata", vec![kdata()], None).unwrap();
        reg.register(&["sina"], "stock_1d_kdata", vec![kdata()], None).unwrap();
        assert_eq!(reg.schemas_of("stock_1d_kdata").unwrap().len(), 1);

        let store = reg.store("sina", "stock_1d_kdata").unwrap();
        assert_eq!(store.tables().unwrap(), vec!["stock_1d_kdata".to_string()]);
    }

    #[test]
    fn store_is_shared_per_namespace() {
        let mut reg = Registry::in_memory();
        reg.register(&["sina"], "stock_1d_kdata", vec![kdata()], None).unwrap();
        let a = reg.store("sina", "stock_1d_kdata").unwrap();
        let b = reg.store("sina", "stock_1d_kdata").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn incompatible_redeclaration_is_rejected() {
        let mut reg = Registry::in_memory();
        reg.register(&["sina"], "stock_1d_kdata", vec![kdata()], None).unwrap();
        let changed = kdata().with_column("adj_factor", ColumnType::Float);
        let err = reg
            .register(&["sina"], "stock_1d_kdata", vec![changed], None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::IncompatibleSchema { .. }));
    }

    #[test]
    fn unbound_provider_is_an_error() {
        let mut reg = Registry::in_memory();
        reg.register(&["sina"], "stock_1d_kdata", vec![kdata()], None).unwrap();
        assert!(matches!(
            reg.store("eastmoney", "stock_1d_kdata"),
            Err(RegistryError::ProviderNotBound { .. })
        ));
        assert!(matches!(
            reg.store("sina", "finance"),
            Err(RegistryError::UnknownDataset(_))
        ));
    }

    #[test]
    fn typed_lookup_by_entity_type_and_level() {
        let mut reg = Registry::in_memory();
        reg.register(
            &["sina"],
            "kdata",
            vec![kdata(), Schema::kdata("index", Level::Week1)],
            None,
        )
        .unwrap();
        let schema = reg.schema_for("kdata", &"index".into(), Level::Week1).unwrap();
        assert_eq!(schema.table, "index_1wk_kdata");
        assert!(reg.schema_for("kdata", &"stock".into(), Level::Week1).is_none());
    }

    #[test]
    fn registries_are_isolated() {
        let mut a = Registry::in_memory();
        let b = Registry::in_memory();
        a.register(&["sina"], "stock_1d_kdata", vec![kdata()], None).unwrap();
        assert!(a.is_registered("sina", "stock_1d_kdata"));
        assert!(!b.is_registered("sina", "stock_1d_kdata"));
        assert!(b.store("sina", "stock_1d_kdata").is_err());
    }

    #[test]
    fn conflict_in_one_namespace_creates_no_tables_in_others() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::Directory(dir.path().to_path_buf());
        let changed = kdata().with_column("adj_factor", ColumnType::Float);

        let mut first = Registry::new(root.clone());
        first.register(&["netease"], "stock_1d_kdata", vec![changed], None).unwrap();
        drop(first);

        let mut reg = Registry::new(root.clone());
        let err = reg
            .register(&["sina", "netease"], "stock_1d_kdata", vec![kdata()], None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::IncompatibleSchema { .. }));
        assert!(!reg.is_registered("sina", "stock_1d_kdata"));

        let sina = Store::open(&root, NamespaceKey::new("sina", "stock_1d_kdata")).unwrap();
        assert!(sina.tables().unwrap().is_empty());
    }
}
