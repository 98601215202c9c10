use crate::core::value::Value;
use crate::core::variable::ConnectorDescriptor;
use crate::engine::builder::Builder;
use crate::engine::config::EngineConfig;
use crate::engine::discipline::Status;
use crate::engine::error::EngineError;
use crate::engine::execution_engine::ExecutionEngine;
use crate::engine::progress::{Progress, ProgressReporter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, instrument};

/// Portable snapshot of a study. Every key is anonymized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyDump {
    pub data: BTreeMap<String, Value>,
    pub status: BTreeMap<String, Status>,
    #[serde(default)]
    pub connectors: BTreeMap<String, ConnectorDescriptor>,
}

/// A named study around one root process.
pub struct Study {
    engine: ExecutionEngine,
}

impl Study {
    pub fn new(study_name: impl Into<String>) -> Self {
        Self::with_config(study_name, EngineConfig::default())
    }

    pub fn with_config(study_name: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            engine: ExecutionEngine::with_config(study_name, config),
        }
    }

    /// Creates a study whose root process is a coupling of `builders` under the given
    /// shared namespaces.
    pub fn with_builders(
        study_name: impl Into<String>,
        namespaces: &BTreeMap<String, String>,
        builders: Vec<Builder>,
    ) -> Self {
        let mut study = Self::new(study_name);
        study.engine.add_ns_def(namespaces);
        study.engine.set_builders_to_coupling_builder(builders);
        study
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    pub fn name(&self) -> &str {
        self.engine.study_name()
    }

    pub fn get_value(&self, full_path: &str) -> Result<&Value, EngineError> {
        Ok(self.engine.get_value(full_path)?)
    }

    /// Loads values keyed by full path.
    pub fn load_data(&mut self, values: &BTreeMap<String, Value>) -> Result<(), EngineError> {
        self.engine.load_study_from_dict(values, None)
    }

    #[instrument(skip_all, name = "study_run", fields(study = %self.name()))]
    pub fn run(&mut self, reporter: &ProgressReporter) -> Result<(), EngineError> {
        info!("Starting study execution.");
        self.engine.execute_with_reporter(reporter)?;
        reporter.report(Progress::Message(format!(
            "Study '{}' executed",
            self.engine.study_name()
        )));
        info!("Study execution complete.");
        Ok(())
    }

    pub fn dump(&self) -> StudyDump {
        let anonymizer = self.engine.anonymizer();
        let connectors = self
            .engine
            .dm()
            .variables()
            .filter_map(|(_, v)| {
                v.connector
                    .clone()
                    .map(|c| (anonymizer.anonymize_key(&v.full_path), c))
            })
            .collect();
        StudyDump {
            data: self.engine.get_anonymized_data_dict(),
            status: self.engine.get_anonymized_disciplines_status_dict(),
            connectors,
        }
    }

    /// Restores a dump: values first, so that the tree is built, then connectors and
    /// statuses.
    pub fn load_dump(&mut self, dump: &StudyDump) -> Result<(), EngineError> {
        self.engine.load_study_from_input_dict(&dump.data)?;
        let anonymizer = self.engine.anonymizer();
        let connectors: BTreeMap<String, ConnectorDescriptor> = dump
            .connectors
            .iter()
            .map(|(k, c)| (anonymizer.unanonymize_key(k), c.clone()))
            .collect();
        self.engine.load_connectors_from_dict(&connectors)?;
        self.engine.load_disciplines_status_dict(&dump.status);
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(&self.dump())?;
        fs::write(path, json).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Study dump written");
        Ok(())
    }

    pub fn load_from_file(&mut self, path: &Path) -> Result<(), EngineError> {
        let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let dump: StudyDump = serde_json::from_str(&content)?;
        self.load_dump(&dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_models::{Disc1, Disc2};
    use tempfile::tempdir;

    fn study(name: &str) -> Study {
        let namespaces: BTreeMap<String, String> =
            [("ns_ac".to_string(), name.to_string())].into();
        Study::with_builders(
            name,
            &namespaces,
            vec![
                Builder::discipline("Disc1", Disc1::default),
                Builder::discipline("Disc2", Disc2::default),
            ],
        )
    }

    #[test]
    fn run_then_dump_and_reload_under_another_name() {
        let mut first = study("study");
        let inputs: BTreeMap<String, Value> = [
            ("study.x".to_string(), Value::Float(5.0)),
            ("study.Disc1.a".to_string(), Value::Float(2.0)),
            ("study.Disc1.b".to_string(), Value::Float(3.0)),
        ]
        .into();
        first.load_data(&inputs).unwrap();
        first.run(&ProgressReporter::new()).unwrap();
        assert_eq!(first.get_value("study.y").unwrap(), &Value::Float(13.0));
        assert_eq!(first.get_value("study.z").unwrap(), &Value::Float(14.0));

        let dir = tempdir().unwrap();
        let path = dir.path().join("study.json");
        first.save(&path).unwrap();

        let mut second = study("renamed");
        second.load_from_file(&path).unwrap();
        assert_eq!(second.get_value("renamed.z").unwrap(), &Value::Float(14.0));
        assert_eq!(second.dump(), first.dump());
    }

    #[test]
    fn dump_keys_are_anonymized() {
        let mut s = study("study");
        s.load_data(&[("study.x".to_string(), Value::Float(1.0))].into())
            .unwrap();
        let dump = s.dump();
        assert!(dump.data.contains_key("<study_ph>.x"));
        assert!(dump.status.contains_key("<study_ph>.Disc2"));
        assert!(dump.data.keys().all(|k| !k.starts_with("study")));
    }

    #[test]
    fn reading_a_missing_dump_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let mut s = study("study");
        assert!(matches!(
            s.load_from_file(&dir.path().join("absent.json")),
            Err(EngineError::Io { .. })
        ));
    }
}
