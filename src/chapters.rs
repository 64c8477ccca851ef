//! Seams to the chapter store the rest of the system lives behind. Scraping,
//! novel metadata and reader-facing persistence are external collaborators;
//! the worker only ever sees these traits.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::glossary::Glossary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub paragraphs: Vec<String>,
}

/// Per-chapter summary used to decide what a job still has to translate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationOutline {
    pub chapter_id: String,
    pub translated: bool,
    pub glossary_uuid: Option<String>,
}

impl TranslationOutline {
    /// Untranslated chapters and chapters stamped with a stale glossary uuid
    /// both need (re-)translation.
    pub fn needs_translation(&self, glossary: &Glossary) -> bool {
        if !self.translated {
            return true;
        }
        self.glossary_uuid.as_deref() != Some(glossary.uuid.as_str())
    }
}

#[async_trait]
pub trait ChapterSource: Send + Sync {
    async fn translation_outlines(
        &self,
        provider_id: &str,
        novel_id: &str,
        translator_id: &str,
    ) -> Result<Vec<TranslationOutline>>;

    async fn glossary(&self, provider_id: &str, novel_id: &str) -> Result<Glossary>;

    async fn get_or_sync_remote(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        force_sync: bool,
    ) -> Result<Chapter>;
}

#[async_trait]
pub trait ChapterSink: Send + Sync {
    async fn update_translation(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        translator_id: &str,
        glossary: &Glossary,
        paragraphs: &[String],
    ) -> Result<()>;
}

/// Failed prompt/output pairs are kept for offline model diagnosis.
#[async_trait]
pub trait FailCaseLog: Send + Sync {
    async fn record(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        prompt: &str,
        result: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTranslation {
    pub glossary_uuid: String,
    pub paragraphs: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NovelEntry {
    glossary: Glossary,
    chapters: Vec<(String, Vec<String>)>,
    translations: HashMap<String, StoredTranslation>,
}

/// In-memory chapter store, used by tests and as a throwaway local library.
#[derive(Debug, Default)]
pub struct MemChapterStore {
    novels: Mutex<HashMap<(String, String), NovelEntry>>,
}

impl MemChapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_novel(
        &self,
        provider_id: &str,
        novel_id: &str,
        glossary: Glossary,
        chapters: Vec<(String, Vec<String>)>,
    ) {
        if let Ok(mut novels) = self.novels.lock() {
            novels.insert(
                (provider_id.to_string(), novel_id.to_string()),
                NovelEntry {
                    glossary,
                    chapters,
                    translations: HashMap::new(),
                },
            );
        }
    }

    pub fn translation(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
    ) -> Option<StoredTranslation> {
        let novels = self.novels.lock().ok()?;
        novels
            .get(&(provider_id.to_string(), novel_id.to_string()))?
            .translations
            .get(chapter_id)
            .cloned()
    }

    fn with_novel<T>(
        &self,
        provider_id: &str,
        novel_id: &str,
        apply: impl FnOnce(&mut NovelEntry) -> Result<T>,
    ) -> Result<T> {
        let mut novels = self
            .novels
            .lock()
            .map_err(|_| anyhow!("chapter store lock poisoned"))?;
        let entry = novels
            .get_mut(&(provider_id.to_string(), novel_id.to_string()))
            .ok_or_else(|| anyhow!("unknown novel {}/{}", provider_id, novel_id))?;
        apply(entry)
    }
}

#[async_trait]
impl ChapterSource for MemChapterStore {
    async fn translation_outlines(
        &self,
        provider_id: &str,
        novel_id: &str,
        _translator_id: &str,
    ) -> Result<Vec<TranslationOutline>> {
        self.with_novel(provider_id, novel_id, |entry| {
            Ok(entry
                .chapters
                .iter()
                .map(|(chapter_id, _)| {
                    let stored = entry.translations.get(chapter_id);
                    TranslationOutline {
                        chapter_id: chapter_id.clone(),
                        translated: stored.is_some(),
                        glossary_uuid: stored.map(|t| t.glossary_uuid.clone()),
                    }
                })
                .collect())
        })
    }

    async fn glossary(&self, provider_id: &str, novel_id: &str) -> Result<Glossary> {
        self.with_novel(provider_id, novel_id, |entry| Ok(entry.glossary.clone()))
    }

    async fn get_or_sync_remote(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        _force_sync: bool,
    ) -> Result<Chapter> {
        self.with_novel(provider_id, novel_id, |entry| {
            entry
                .chapters
                .iter()
                .find(|(id, _)| id == chapter_id)
                .map(|(_, paragraphs)| Chapter {
                    paragraphs: paragraphs.clone(),
                })
                .ok_or_else(|| {
                    anyhow!("unknown chapter {}/{}/{}", provider_id, novel_id, chapter_id)
                })
        })
    }
}

#[async_trait]
impl ChapterSink for MemChapterStore {
    async fn update_translation(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        _translator_id: &str,
        glossary: &Glossary,
        paragraphs: &[String],
    ) -> Result<()> {
        self.with_novel(provider_id, novel_id, |entry| {
            entry.translations.insert(
                chapter_id.to_string(),
                StoredTranslation {
                    glossary_uuid: glossary.uuid.clone(),
                    paragraphs: paragraphs.to_vec(),
                },
            );
            Ok(())
        })
    }
}

/// File-backed library: one JSON document per novel under
/// `{dir}/{provider}/{novel}.json`, translations written back in place.
#[derive(Debug)]
pub struct FileChapterStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileChapterStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create library directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn novel_path(&self, provider_id: &str, novel_id: &str) -> PathBuf {
        self.dir.join(provider_id).join(format!("{}.json", novel_id))
    }

    fn read_novel(&self, provider_id: &str, novel_id: &str) -> Result<NovelEntry> {
        let path = self.novel_path(provider_id, novel_id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("unknown novel {}/{}", provider_id, novel_id))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse novel file: {}", path.display()))
    }

    fn write_novel(&self, provider_id: &str, novel_id: &str, entry: &NovelEntry) -> Result<()> {
        let path = self.novel_path(provider_id, novel_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(entry)?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write novel file: {}", path.display()))
    }
}

#[async_trait]
impl ChapterSource for FileChapterStore {
    async fn translation_outlines(
        &self,
        provider_id: &str,
        novel_id: &str,
        _translator_id: &str,
    ) -> Result<Vec<TranslationOutline>> {
        let _guard = self.lock.lock();
        let entry = self.read_novel(provider_id, novel_id)?;
        Ok(entry
            .chapters
            .iter()
            .map(|(chapter_id, _)| {
                let stored = entry.translations.get(chapter_id);
                TranslationOutline {
                    chapter_id: chapter_id.clone(),
                    translated: stored.is_some(),
                    glossary_uuid: stored.map(|t| t.glossary_uuid.clone()),
                }
            })
            .collect())
    }

    async fn glossary(&self, provider_id: &str, novel_id: &str) -> Result<Glossary> {
        let _guard = self.lock.lock();
        Ok(self.read_novel(provider_id, novel_id)?.glossary)
    }

    async fn get_or_sync_remote(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        _force_sync: bool,
    ) -> Result<Chapter> {
        let _guard = self.lock.lock();
        let entry = self.read_novel(provider_id, novel_id)?;
        entry
            .chapters
            .into_iter()
            .find(|(id, _)| id == chapter_id)
            .map(|(_, paragraphs)| Chapter { paragraphs })
            .ok_or_else(|| anyhow!("unknown chapter {}/{}/{}", provider_id, novel_id, chapter_id))
    }
}

#[async_trait]
impl ChapterSink for FileChapterStore {
    async fn update_translation(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        _translator_id: &str,
        glossary: &Glossary,
        paragraphs: &[String],
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entry = self.read_novel(provider_id, novel_id)?;
        entry.translations.insert(
            chapter_id.to_string(),
            StoredTranslation {
                glossary_uuid: glossary.uuid.clone(),
                paragraphs: paragraphs.to_vec(),
            },
        );
        self.write_novel(provider_id, novel_id, &entry)
    }
}

#[derive(Debug, Serialize)]
struct FailCase<'a> {
    at: String,
    provider_id: &'a str,
    novel_id: &'a str,
    chapter_id: &'a str,
    prompt: &'a str,
    result: &'a str,
}

/// Appends one JSON line per failing prompt/output pair.
#[derive(Debug)]
pub struct FileFailCaseLog {
    path: PathBuf,
}

impl FileFailCaseLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FailCaseLog for FileFailCaseLog {
    async fn record(
        &self,
        provider_id: &str,
        novel_id: &str,
        chapter_id: &str,
        prompt: &str,
        result: &str,
    ) -> Result<()> {
        let at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let line = serde_json::to_string(&FailCase {
            at,
            provider_id,
            novel_id,
            chapter_id,
            prompt,
            result,
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open fail-case log: {}", self.path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("failed to write fail-case log: {}", self.path.display()))
    }
}

/// Keeps fail cases in memory; the default when no data dir is configured.
#[derive(Debug, Default)]
pub struct MemFailCaseLog {
    records: Mutex<Vec<(String, String)>>,
}

impl MemFailCaseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded (prompt, result) pairs in arrival order.
    pub fn records(&self) -> Vec<(String, String)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FailCaseLog for MemFailCaseLog {
    async fn record(
        &self,
        _provider_id: &str,
        _novel_id: &str,
        _chapter_id: &str,
        prompt: &str,
        result: &str,
    ) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push((prompt.to_string(), result.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn glossary_v1() -> Glossary {
        Glossary::new(BTreeMap::new())
    }

    #[tokio::test]
    async fn mem_store_outlines_reflect_translations() {
        let store = MemChapterStore::new();
        let glossary = glossary_v1();
        store.insert_novel(
            "providerX",
            "novel1",
            glossary.clone(),
            vec![
                ("c1".to_string(), vec!["一".to_string()]),
                ("c2".to_string(), vec!["二".to_string()]),
            ],
        );

        let outlines = store
            .translation_outlines("providerX", "novel1", "gpu")
            .await
            .unwrap();
        assert_eq!(outlines.len(), 2);
        assert!(outlines.iter().all(|o| o.needs_translation(&glossary)));

        store
            .update_translation("providerX", "novel1", "c1", "gpu", &glossary, &["1".to_string()])
            .await
            .unwrap();
        let outlines = store
            .translation_outlines("providerX", "novel1", "gpu")
            .await
            .unwrap();
        assert!(!outlines[0].needs_translation(&glossary));
        assert!(outlines[1].needs_translation(&glossary));
    }

    #[tokio::test]
    async fn stale_glossary_uuid_marks_chapter_expired() {
        let store = MemChapterStore::new();
        let old = glossary_v1();
        store.insert_novel(
            "providerX",
            "novel1",
            old.clone(),
            vec![("c1".to_string(), vec!["一".to_string()])],
        );
        store
            .update_translation("providerX", "novel1", "c1", "gpu", &old, &["1".to_string()])
            .await
            .unwrap();

        let current = glossary_v1();
        let outlines = store
            .translation_outlines("providerX", "novel1", "gpu")
            .await
            .unwrap();
        assert!(outlines[0].translated);
        assert!(outlines[0].needs_translation(&current));
    }

    #[tokio::test]
    async fn file_store_round_trips_translations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChapterStore::open(dir.path()).unwrap();
        let glossary = glossary_v1();
        store
            .write_novel(
                "providerX",
                "novel1",
                &NovelEntry {
                    glossary: glossary.clone(),
                    chapters: vec![("c1".to_string(), vec!["一".to_string()])],
                    translations: HashMap::new(),
                },
            )
            .unwrap();

        let chapter = store
            .get_or_sync_remote("providerX", "novel1", "c1", false)
            .await
            .unwrap();
        assert_eq!(chapter.paragraphs, vec!["一".to_string()]);

        store
            .update_translation("providerX", "novel1", "c1", "gpu", &glossary, &["1".to_string()])
            .await
            .unwrap();
        let outlines = store
            .translation_outlines("providerX", "novel1", "gpu")
            .await
            .unwrap();
        assert!(outlines[0].translated);
        assert_eq!(outlines[0].glossary_uuid.as_deref(), Some(glossary.uuid.as_str()));
    }
}
