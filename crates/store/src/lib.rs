//! File-backed store of per-job result documents.
//!
//! Each run owns a subdirectory of the results directory, and each job of the run owns
//! exactly one document, `<key>.json`, inside it. Every mutation is a read-modify-write applied through a temp file and a
//! rename, so readers only ever observe complete documents. Mutations are also
//! appended to `<key>.events.jsonl`.

use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use fanout_core::{
    models::{AggregateReport, CheckEntry, CheckStatus, JobResult, JobStatus},
    util::{now, sanitize_component},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const DOCUMENT_EXTENSION: &str = "json";
const EVENTS_SUFFIX: &str = ".events.jsonl";
const SUMMARY_FILE: &str = "summary.json";
const KEY_SEPARATOR: &str = "--";
const SUPERSEDED_SUFFIX: &str = ".superseded";

/// Identity of one job document: the integration name plus the instance that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(integration: &str, instance: &str) -> Self {
        // The instance part never contains the separator, so the last one splits the key
        let mut instance = sanitize_component(instance);
        while instance.contains(KEY_SEPARATOR) {
            instance = instance.replace(KEY_SEPARATOR, "-");
        }
        Self(format!("{}{KEY_SEPARATOR}{instance}", sanitize_component(integration)))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// The (sanitized) integration part of the key.
    pub fn integration(&self) -> &str {
        self.0.rsplit_once(KEY_SEPARATOR).map_or(self.0.as_str(), |(integration, _)| integration)
    }

    fn from_file_stem(stem: &str) -> Option<Self> {
        stem.contains(KEY_SEPARATOR).then(|| Self(stem.to_string()))
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// One line of a document's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(flatten)]
    pub event: StoreEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    Created,
    CheckAppended { name: String, status: CheckStatus },
    FieldSet { field: String },
    Finished { status: JobStatus },
}

/// A document read back from disk. Documents that fail to parse are reported, not dropped.
#[derive(Debug)]
pub struct StoredDocument {
    pub key: DocumentKey,
    pub result: Result<JobResult>,
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create results directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    /// The store holding the documents of one run, in its own subdirectory.
    pub fn for_run(&self, run_id: &str) -> Result<Self> {
        Self::open(self.root.join(sanitize_component(run_id)))
    }

    /// Move any documents left by an earlier attempt aside, so the store starts empty.
    ///
    /// The previous contents are kept next to the store as `<dir>.superseded-<time>-<nonce>`.
    /// Run ids are sanitized without dots, so the archive never collides with a run.
    pub fn supersede(&self) -> Result<Option<PathBuf>> {
        let mut entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read results directory {}", self.root.display()))?;
        if entries.next().is_none() {
            return Ok(None);
        }
        let name = self.root.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let archive = self.root.with_file_name(format!(
            "{name}{SUPERSEDED_SUFFIX}-{}-{:04x}",
            now().unix_timestamp(),
            rand::random::<u16>()
        ));
        fs::rename(&self.root, &archive)
            .with_context(|| format!("Failed to move {} aside", self.root.display()))?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create results directory {}", self.root.display()))?;
        tracing::warn!("Superseded earlier results of this run, moved to {}", archive.display());
        Ok(Some(archive))
    }

    pub fn path_for(&self, key: &DocumentKey) -> PathBuf {
        self.root.join(format!("{key}.{DOCUMENT_EXTENSION}"))
    }

    fn events_path(&self, key: &DocumentKey) -> PathBuf {
        self.root.join(format!("{key}{EVENTS_SUFFIX}"))
    }

    /// Create a new document. Fails if the key is already taken.
    pub fn create(&self, key: &DocumentKey, doc: &JobResult) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            bail!("Result document {} already exists", path.display());
        }
        self.write_atomic(&path, doc)?;
        self.log(key, StoreEvent::Created)?;
        tracing::debug!(key = %key, "Created result document");
        Ok(())
    }

    pub fn load(&self, key: &DocumentKey) -> Result<Option<JobResult>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        read_document(&path).map(Some)
    }

    /// Apply `f` to the document and replace it atomically.
    ///
    /// The check list is append-only: an update that removes or rewrites an existing
    /// entry is refused and the stored document is left untouched.
    pub fn update<F>(&self, key: &DocumentKey, event: StoreEvent, f: F) -> Result<JobResult>
    where F: FnOnce(&mut JobResult) {
        let path = self.path_for(key);
        let mut doc = self
            .load(key)?
            .ok_or_else(|| anyhow!("Result document {} does not exist", path.display()))?;
        let previous = doc.checks.clone();
        f(&mut doc);
        if doc.checks.len() < previous.len() || doc.checks[..previous.len()] != previous[..] {
            bail!("Refusing to rewrite existing checks in {}", path.display());
        }
        self.write_atomic(&path, &doc)?;
        self.log(key, event)?;
        Ok(doc)
    }

    pub fn append_check(&self, key: &DocumentKey, entry: CheckEntry) -> Result<JobResult> {
        let event = StoreEvent::CheckAppended { name: entry.name.clone(), status: entry.status };
        self.update(key, event, |doc| doc.checks.push(entry))
    }

    /// Set the terminal status. A document that is already terminal is returned unchanged.
    pub fn finish(&self, key: &DocumentKey, status: JobStatus, message: String) -> Result<JobResult> {
        let doc = self.load(key)?.ok_or_else(|| anyhow!("Result document {key} does not exist"))?;
        if doc.status.is_terminal() {
            tracing::warn!(key = %key, status = %doc.status, "Result document already terminal");
            return Ok(doc);
        }
        let at = now();
        self.update(key, StoreEvent::Finished { status }, |doc| {
            doc.finish(status, message, at);
        })
    }

    /// All documents in the store, ordered by key.
    pub fn list(&self) -> Result<Vec<StoredDocument>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read results directory {}", self.root.display()))?;
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXTENSION) {
                continue;
            }
            let Some(key) =
                path.file_stem().and_then(|s| s.to_str()).and_then(DocumentKey::from_file_stem)
            else {
                continue;
            };
            out.push(StoredDocument { key, result: read_document(&path) });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    pub fn events(&self, key: &DocumentKey) -> Result<Vec<LoggedEvent>> {
        let path = self.events_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).with_context(|| format!("Malformed event in {}", path.display()))
            })
            .collect()
    }

    pub fn write_summary(&self, report: &AggregateReport) -> Result<PathBuf> {
        let path = self.root.join(SUMMARY_FILE);
        self.write_atomic(&path, report)?;
        Ok(path)
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value).context("Failed to serialize document")?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)
            .context("Failed to create temp file")?;
        temp.write_all(&json).context("Failed to write temp file")?;
        temp.as_file().sync_all().context("Failed to sync temp file")?;
        temp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn log(&self, key: &DocumentKey, event: StoreEvent) -> Result<()> {
        let path = self.events_path(key);
        let mut line = serde_json::to_string(&LoggedEvent { at: now(), event })?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("Failed to append to {}", path.display()))
    }
}

fn read_document(path: &Path) -> Result<JobResult> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(store: &ResultStore, integration: &str, instance: &str) -> DocumentKey {
        let key = DocumentKey::new(integration, instance);
        store.create(&key, &JobResult::new(integration, Some(1), None, now())).unwrap();
        key
    }

    #[test]
    fn test_create_load_finish() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path().join("results")).unwrap();
        let key = seeded(&store, "foo", "job-1");
        assert!(store.create(&key, &JobResult::new("foo", None, None, now())).is_err());

        store.append_check(&key, CheckEntry::new("exists", CheckStatus::Passed, "")).unwrap();
        let doc = store.finish(&key, JobStatus::Passed, "ok".to_string()).unwrap();
        assert_eq!(doc.status, JobStatus::Passed);
        assert!(doc.end_time.is_some());

        // Second finish is a no-op
        let doc = store.finish(&key, JobStatus::Failed, "late".to_string()).unwrap();
        assert_eq!(doc.status, JobStatus::Passed);
        assert_eq!(store.load(&key).unwrap().unwrap().message.as_deref(), Some("ok"));

        let events = store.events(&key).unwrap();
        let kinds: Vec<_> = events.into_iter().map(|e| e.event).collect();
        assert_eq!(kinds, vec![
            StoreEvent::Created,
            StoreEvent::CheckAppended { name: "exists".to_string(), status: CheckStatus::Passed },
            StoreEvent::Finished { status: JobStatus::Passed },
        ]);
    }

    #[test]
    fn test_checks_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let key = seeded(&store, "foo", "1");
        store.append_check(&key, CheckEntry::new("a", CheckStatus::Passed, "")).unwrap();
        store.append_check(&key, CheckEntry::new("b", CheckStatus::Failed, "x")).unwrap();

        let err = store.update(&key, StoreEvent::FieldSet { field: "checks".into() }, |doc| {
            doc.checks.remove(0);
        });
        assert!(err.is_err());
        let err = store.update(&key, StoreEvent::FieldSet { field: "checks".into() }, |doc| {
            doc.checks[1].message = "rewritten".to_string();
        });
        assert!(err.is_err());

        let doc = store.load(&key).unwrap().unwrap();
        let names: Vec<_> = doc.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(doc.checks[1].message, "x");
    }

    #[test]
    fn test_list_ordered_and_reports_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        seeded(&store, "zeta", "1");
        seeded(&store, "alpha", "2");
        std::fs::write(dir.path().join("broken--3.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        store
            .write_summary(&AggregateReport {
                total: 0,
                passed: 0,
                failed: 0,
                not_found: 0,
                results: vec![],
            })
            .unwrap();

        let docs = store.list().unwrap();
        let keys: Vec<_> = docs.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, ["alpha--2", "broken--3", "zeta--1"]);
        assert!(docs[1].result.is_err());
        assert_eq!(docs[1].key.integration(), "broken");
        assert_eq!(docs[0].result.as_ref().unwrap().integration, "alpha");
    }

    #[test]
    fn test_key_integration_with_separator() {
        let key = DocumentKey::new("a--b", "run--1-2");
        assert_eq!(key.as_str(), "a--b--run-1-2");
        assert_eq!(key.integration(), "a--b");
        assert_eq!(DocumentKey::new("foo", "x---y").integration(), "foo");

        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        std::fs::write(store.path_for(&key), b"{").unwrap();
        let docs = store.list().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].key.integration(), "a--b");
    }

    #[test]
    fn test_runs_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let root = ResultStore::open(dir.path()).unwrap();
        let first = root.for_run("build/1").unwrap();
        let second = root.for_run("build/2").unwrap();
        seeded(&first, "foo", "1");
        seeded(&first, "bar", "2");
        seeded(&second, "foo", "1");
        assert_eq!(first.list().unwrap().len(), 2);
        assert_eq!(second.list().unwrap().len(), 1);
        assert!(root.list().unwrap().is_empty());
        assert_eq!(first.root(), dir.path().join("build-1"));
    }

    #[test]
    fn test_supersede() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap().for_run("issue-5").unwrap();
        assert_eq!(store.supersede().unwrap(), None);

        let key = seeded(&store, "foo", "issue-5-0");
        let archive = store.supersede().unwrap().unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.load(&key).unwrap().is_none());
        assert!(archive.join(format!("{key}.json")).exists());
        assert!(archive.file_name().unwrap().to_str().unwrap().starts_with("issue-5.superseded-"));

        // The key is free again
        seeded(&store, "foo", "issue-5-0");
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let key = seeded(&store, "foo", "1");
        for i in 0..5 {
            store
                .append_check(&key, CheckEntry::new(format!("c{i}"), CheckStatus::Passed, ""))
                .unwrap();
        }
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
    }
}
