//! External data sources feeding (and receiving) study variables.

use crate::core::value::Value;
use crate::core::variable::ConnectorDescriptor;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("No connector registered under '{0}'")]
    UnknownConnector(String),

    #[error("Dataset '{dataset}' not found in connector '{connector}'")]
    UnknownDataset { connector: String, dataset: String },

    #[error("Key '{key}' is missing from dataset '{dataset}'")]
    MissingKey { dataset: String, key: String },

    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in '{path}': {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A source of named values grouped in datasets.
pub trait DatasetConnector: Send + Sync {
    fn get_values(
        &self,
        dataset_id: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, DatasetError>;

    fn write_values(
        &self,
        dataset_id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), DatasetError>;
}

/// One JSON file per dataset, `{root}/{dataset_id}.json`, holding a `key -> value` map.
#[derive(Debug, Clone)]
pub struct JsonDatasetConnector {
    root: PathBuf,
}

impl JsonDatasetConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join(format!("{dataset_id}.json"))
    }

    fn read(path: &Path) -> Result<BTreeMap<String, Value>, DatasetError> {
        let content = fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl DatasetConnector for JsonDatasetConnector {
    fn get_values(
        &self,
        dataset_id: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, DatasetError> {
        let path = self.dataset_path(dataset_id);
        if !path.exists() {
            return Err(DatasetError::UnknownDataset {
                connector: self.root.display().to_string(),
                dataset: dataset_id.to_string(),
            });
        }
        let mut content = Self::read(&path)?;
        keys.iter()
            .map(|key| {
                content
                    .remove(key)
                    .map(|v| (key.clone(), v))
                    .ok_or_else(|| DatasetError::MissingKey {
                        dataset: dataset_id.to_string(),
                        key: key.clone(),
                    })
            })
            .collect()
    }

    /// Merges `values` into the dataset file, creating it if needed.
    fn write_values(
        &self,
        dataset_id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), DatasetError> {
        let path = self.dataset_path(dataset_id);
        let mut content = if path.exists() {
            Self::read(&path)?
        } else {
            BTreeMap::new()
        };
        content.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        let json = serde_json::to_string_pretty(&content).map_err(|source| DatasetError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| DatasetError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), n_values = values.len(), "Dataset written");
        Ok(())
    }
}

/// Datasets held in memory.
#[derive(Debug, Default)]
pub struct InMemoryConnector {
    datasets: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, dataset_id: &str, values: BTreeMap<String, Value>) -> Self {
        self.lock().insert(dataset_id.to_string(), values);
        self
    }

    pub fn dataset(&self, dataset_id: &str) -> Option<BTreeMap<String, Value>> {
        self.lock().get(dataset_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Value>>> {
        self.datasets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DatasetConnector for InMemoryConnector {
    fn get_values(
        &self,
        dataset_id: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, DatasetError> {
        let datasets = self.lock();
        let dataset = datasets
            .get(dataset_id)
            .ok_or_else(|| DatasetError::UnknownDataset {
                connector: "memory".to_string(),
                dataset: dataset_id.to_string(),
            })?;
        keys.iter()
            .map(|key| {
                dataset
                    .get(key)
                    .map(|v| (key.clone(), v.clone()))
                    .ok_or_else(|| DatasetError::MissingKey {
                        dataset: dataset_id.to_string(),
                        key: key.clone(),
                    })
            })
            .collect()
    }

    fn write_values(
        &self,
        dataset_id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), DatasetError> {
        self.lock()
            .entry(dataset_id.to_string())
            .or_default()
            .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Registry of connectors by id.
#[derive(Default, Clone)]
pub struct DatasetsManager {
    connectors: HashMap<String, Arc<dyn DatasetConnector>>,
}

impl DatasetsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector_id: impl Into<String>, connector: Arc<dyn DatasetConnector>) {
        self.connectors.insert(connector_id.into(), connector);
    }

    pub fn connector(&self, connector_id: &str) -> Result<&Arc<dyn DatasetConnector>, DatasetError> {
        self.connectors
            .get(connector_id)
            .ok_or_else(|| DatasetError::UnknownConnector(connector_id.to_string()))
    }

    /// Fetches the value a descriptor points to. `default_key` is used when the descriptor
    /// names no key.
    pub fn fetch(
        &self,
        descriptor: &ConnectorDescriptor,
        default_key: &str,
    ) -> Result<Value, DatasetError> {
        let key = descriptor.key.as_deref().unwrap_or(default_key).to_string();
        let mut values = self
            .connector(&descriptor.connector_id)?
            .get_values(&descriptor.dataset_id, std::slice::from_ref(&key))?;
        values.remove(&key).ok_or(DatasetError::MissingKey {
            dataset: descriptor.dataset_id.clone(),
            key,
        })
    }

    pub fn write(
        &self,
        connector_id: &str,
        dataset_id: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), DatasetError> {
        self.connector(connector_id)?.write_values(dataset_id, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn descriptor(connector: &str, dataset: &str, key: Option<&str>) -> ConnectorDescriptor {
        ConnectorDescriptor {
            connector_id: connector.to_string(),
            dataset_id: dataset.to_string(),
            key: key.map(str::to_string),
        }
    }

    #[test]
    fn json_connector_round_trips_through_files() {
        let dir = tempdir().unwrap();
        let connector = JsonDatasetConnector::new(dir.path());
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), Value::Float(2.0));
        connector.write_values("inputs", &values).unwrap();

        let mut more = BTreeMap::new();
        more.insert("b".to_string(), Value::Int(3));
        connector.write_values("inputs", &more).unwrap();

        let read = connector
            .get_values("inputs", &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(read["a"], Value::Float(2.0));
        assert_eq!(read["b"], Value::Int(3));
    }

    #[test]
    fn json_connector_reports_missing_dataset_and_key() {
        let dir = tempdir().unwrap();
        let connector = JsonDatasetConnector::new(dir.path());
        assert!(matches!(
            connector.get_values("nope", &["a".to_string()]),
            Err(DatasetError::UnknownDataset { .. })
        ));
        connector.write_values("d", &BTreeMap::new()).unwrap();
        assert!(matches!(
            connector.get_values("d", &["a".to_string()]),
            Err(DatasetError::MissingKey { .. })
        ));
    }

    #[test]
    fn manager_fetches_by_descriptor_key_or_default_name() {
        let mut dataset = BTreeMap::new();
        dataset.insert("a".to_string(), Value::Float(1.0));
        dataset.insert("alias".to_string(), Value::Float(7.0));
        let mut manager = DatasetsManager::new();
        manager.register("mem", Arc::new(InMemoryConnector::new().with_dataset("d", dataset)));

        assert_eq!(manager.fetch(&descriptor("mem", "d", None), "a").unwrap(), Value::Float(1.0));
        assert_eq!(
            manager.fetch(&descriptor("mem", "d", Some("alias")), "a").unwrap(),
            Value::Float(7.0)
        );
        assert!(matches!(
            manager.fetch(&descriptor("other", "d", None), "a"),
            Err(DatasetError::UnknownConnector(id)) if id == "other"
        ));
    }
}
