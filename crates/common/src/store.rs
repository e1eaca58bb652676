//! Durable pipeline store
//!
//! Single-file map from pipeline identifier to record. Every mutation
//! serializes the full map and atomically replaces the file, so a crash
//! never leaves a half-written store behind. The store is authoritative for
//! everything except live build state, which is reconciled on demand against
//! the CI engine.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{CiBinding, PipelineRecord};

/// File-backed pipeline store.
///
/// Read-modify-write cycles run under a process-wide lock; the lock is held
/// across the full cycle so concurrent handlers never interleave partial maps.
pub struct PipelineStore {
    db_file: PathBuf,
    lock: Mutex<()>,
}

impl PipelineStore {
    pub fn new<P: Into<PathBuf>>(db_file: P) -> Self {
        Self {
            db_file: db_file.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_file
    }

    /// Load the full identifier -> record map.
    pub fn load_all(&self) -> Result<BTreeMap<String, PipelineRecord>> {
        let _guard = self.lock.lock();
        self.read_map()
    }

    /// Fetch a single record.
    pub fn get(&self, pipeline_id: &str) -> Result<Option<PipelineRecord>> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(pipeline_id))
    }

    /// Insert or replace a record.
    pub fn put(&self, pipeline_id: &str, record: PipelineRecord) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(pipeline_id.to_string(), record);
        self.write_map(&map)
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, pipeline_id: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        let existed = map.remove(pipeline_id).is_some();
        if existed {
            self.write_map(&map)?;
        }
        Ok(existed)
    }

    /// Mutate the CI binding of a record in place.
    ///
    /// The closure receives the current binding slot; the record is
    /// persisted afterwards. Errors with `NotFound` when the identifier is
    /// absent.
    pub fn update_ci<F>(&self, pipeline_id: &str, mutate: F) -> Result<PipelineRecord>
    where
        F: FnOnce(&mut Option<CiBinding>),
    {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        let record = map
            .get_mut(pipeline_id)
            .ok_or_else(|| Error::NotFound(pipeline_id.to_string()))?;
        mutate(&mut record.ci);
        let updated = record.clone();
        self.write_map(&map)?;
        Ok(updated)
    }

    fn read_map(&self) -> Result<BTreeMap<String, PipelineRecord>> {
        if !self.db_file.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.db_file)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_map(&self, map: &BTreeMap<String, PipelineRecord>) -> Result<()> {
        let parent = self
            .db_file
            .parent()
            .ok_or_else(|| Error::Internal(format!("store path has no parent: {}", self.db_file.display())))?;
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            debug!("Store path: parent folder created");
        }

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(serde_json::to_string(map)?.as_bytes())?;
        tmp.persist(&self.db_file)
            .map_err(|e| Error::Io(e.error))?;
        debug!("Store persisted ({} pipelines)", map.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Artifacts, BuildInfo, BuildStatus, ComposerFile, PipelineRequest};

    fn sample_record(name: &str) -> PipelineRecord {
        PipelineRecord {
            pipeline_repo: format!("eosc-synergy/{}.sqaaas", name),
            pipeline_repo_url: format!("https://github.com/eosc-synergy/{}.sqaaas", name),
            raw_request: PipelineRequest {
                name: name.to_string(),
                config_data: vec![serde_json::json!({"sqa_criteria": {}})],
                composer_data: serde_json::json!({"services": {}}),
                jenkinsfile_data: serde_json::json!({}),
            },
            artifacts: Artifacts {
                config: vec![],
                composer: ComposerFile {
                    data_json: serde_json::json!({"services": {}}),
                    data_yml: "services: {}\n".to_string(),
                    file_name: ".sqa/docker-compose.yml".to_string(),
                },
                jenkinsfile: "pipeline {}".to_string(),
                commands_scripts: vec![],
            },
            ci: None,
        }
    }

    fn temp_store() -> (tempfile::TempDir, PipelineStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PipelineStore::new(dir.path().join("state/sqaaas.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_empty_map() {
        let (_dir, store) = temp_store();
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, store) = temp_store();
        store.put("id-1", sample_record("demo")).unwrap();

        let back = store.get("id-1").unwrap().unwrap();
        assert_eq!(back.pipeline_repo, "eosc-synergy/demo.sqaaas");
        assert_eq!(back.raw_request.name, "demo");
    }

    #[test]
    fn test_parent_dir_created_on_first_write() {
        let (dir, store) = temp_store();
        assert!(!dir.path().join("state").exists());
        store.put("id-1", sample_record("demo")).unwrap();
        assert!(dir.path().join("state/sqaaas.json").exists());
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = temp_store();
        store.put("id-1", sample_record("demo")).unwrap();
        assert!(store.delete("id-1").unwrap());
        assert!(!store.delete("id-1").unwrap());
        assert!(store.get("id-1").unwrap().is_none());
    }

    #[test]
    fn test_update_ci_missing_id() {
        let (_dir, store) = temp_store();
        let err = store.update_ci("ghost", |_| {}).unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn test_update_ci_persists() {
        let (_dir, store) = temp_store();
        store.put("id-1", sample_record("demo")).unwrap();

        let updated = store
            .update_ci("id-1", |ci| {
                *ci = Some(CiBinding {
                    job_name: "org/demo.sqaaas/main".to_string(),
                    issue_badge: true,
                    scan_org_wait: false,
                    build_info: BuildInfo {
                        status: BuildStatus::Queued,
                        item_number: Some(7),
                        ..Default::default()
                    },
                });
            })
            .unwrap();
        assert_eq!(updated.ci.as_ref().unwrap().build_info.item_number, Some(7));

        let back = store.get("id-1").unwrap().unwrap();
        let ci = back.ci.unwrap();
        assert_eq!(ci.build_info.status, BuildStatus::Queued);
        assert!(ci.issue_badge);
    }
}
