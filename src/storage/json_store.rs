use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::common::{FaceGateError, Result};
use crate::core::descriptor::Descriptor;
use crate::storage::EnrollmentStore;

/// Local key-value document on disk.
///
/// The file holds a JSON object; the enrollment key maps to a JSON array of
/// numbers. Other keys are left untouched on write.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    key: String,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(FaceGateError::Storage(format!(
                "{} is not a JSON object", self.path.display()
            ))),
            Err(e) => Err(FaceGateError::Storage(format!(
                "Failed to parse {}: {}", self.path.display(), e
            ))),
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl EnrollmentStore for JsonFileStore {
    fn get(&self) -> Result<Option<Descriptor>> {
        let mut document = self.read_document()?;
        let Some(value) = document.remove(&self.key) else {
            return Ok(None);
        };

        let descriptor = serde_json::from_value::<Descriptor>(value).map_err(|e| {
            FaceGateError::Storage(format!(
                "Invalid descriptor under '{}' in {}: {}", self.key, self.path.display(), e
            ))
        })?;
        Ok(Some(descriptor))
    }

    fn put(&self, descriptor: &Descriptor) -> Result<()> {
        let mut document = self.read_document()?;
        document.insert(self.key.clone(), serde_json::to_value(descriptor)?);
        self.write_document(&document)?;

        tracing::debug!("Wrote descriptor {} to {}", descriptor.fingerprint(), self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut document = self.read_document()?;
        if document.remove(&self.key).is_some() {
            self.write_document(&document)?;
        }
        Ok(())
    }

    /// Presence of the key is the enrollment signal; the value is only
    /// parsed on `get`.
    fn contains(&self) -> Result<bool> {
        Ok(self.read_document()?.contains_key(&self.key))
    }
}
