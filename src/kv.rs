use std::io;
use std::path::{Path, PathBuf};

/// Small file-backed key-value store for persisted task state.
///
/// Each key maps to one JSON blob file under the store directory; keys
/// are sanitised so arbitrary job identifiers cannot escape it.
#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    pub fn put(&self, key: &str, value: &str) -> io::Result<()> {
        std::fs::write(self.path_for(key), value)
    }

    pub fn remove(&self, key: &str) -> io::Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();

        assert!(kv.get("key_save_job_info_default").is_none());
        kv.put("key_save_job_info_default", r#"{"module":"default"}"#).unwrap();
        assert_eq!(
            kv.get("key_save_job_info_default").unwrap(),
            r#"{"module":"default"}"#
        );

        kv.remove("key_save_job_info_default").unwrap();
        assert!(kv.get("key_save_job_info_default").is_none());
        // Removing a missing key is not an error.
        kv.remove("key_save_job_info_default").unwrap();
    }

    #[test]
    fn test_keys_are_sanitised() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();
        kv.put("key_save_task_info_../evil", "{}").unwrap();
        assert!(kv.get("key_save_task_info_../evil").is_some());
        // Nothing escaped the store directory.
        assert!(dir.path().join("key_save_task_info____evil.json").exists());
    }
}
