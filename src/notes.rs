use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::{extract_title, generate_preview, modified_unix_secs, sanitize_filename};

// ── Note types ─────────────────────────────────────────────────────────────

/// Metadata for list display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub modified: i64,
}

/// Full note content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    pub path: String,
    pub modified: i64,
}

#[derive(Debug, Error)]
pub enum NoteError {
    #[error("note not found: {0}")]
    NotFound(String),
    #[error("invalid note id: {0}")]
    InvalidId(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Store ──────────────────────────────────────────────────────────────────

/// Markdown notes in a flat folder; the note id is the file stem.
#[derive(Debug, Clone)]
pub struct NoteStore {
    folder: PathBuf,
}

impl NoteStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Resolve an id to its file path. Ids that could escape the notes
    /// folder are rejected; they arrive straight from HTTP clients.
    fn note_path(&self, id: &str) -> Result<PathBuf, NoteError> {
        if id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
            || id.starts_with('.')
        {
            return Err(NoteError::InvalidId(id.to_string()));
        }
        Ok(self.folder.join(format!("{id}.md")))
    }

    /// All notes, newest first.
    pub async fn list(&self) -> Result<Vec<NoteMetadata>, NoteError> {
        if !self.folder.exists() {
            return Ok(vec![]);
        }

        let mut notes: Vec<NoteMetadata> = Vec::new();
        let mut entries = fs::read_dir(&self.folder).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_path = entry.path();
            if !file_path.extension().is_some_and(|ext| ext == "md") {
                continue;
            }

            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let Ok(content) = fs::read_to_string(&file_path).await else {
                continue;
            };

            let id = file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();

            notes.push(NoteMetadata {
                id,
                title: extract_title(&content),
                preview: generate_preview(&content),
                modified: modified_unix_secs(&metadata),
            });
        }

        notes.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(notes)
    }

    pub async fn read(&self, id: &str) -> Result<Note, NoteError> {
        let file_path = self.note_path(id)?;
        if !file_path.exists() {
            return Err(NoteError::NotFound(id.to_string()));
        }

        let content = fs::read_to_string(&file_path).await?;
        let metadata = fs::metadata(&file_path).await?;

        Ok(Note {
            id: id.to_string(),
            title: extract_title(&content),
            content,
            path: file_path.to_string_lossy().into_owned(),
            modified: modified_unix_secs(&metadata),
        })
    }

    /// Create a note. With content, the id is derived from the title;
    /// otherwise an `untitled` note is seeded. Ids are uniquified with a
    /// `-N` suffix.
    pub async fn create(&self, content: Option<String>) -> Result<Note, NoteError> {
        fs::create_dir_all(&self.folder).await?;

        let content = content.unwrap_or_else(|| "# Untitled\n\n".to_string());
        let base_id = if content.trim() == "# Untitled" || content.trim().is_empty() {
            "untitled".to_string()
        } else {
            sanitize_filename(&extract_title(&content))
        };

        let id = self.unique_id(&base_id);
        self.write_note(&id, content).await
    }

    /// Write content for an id. Saving an id that does not exist yet
    /// creates the file, matching editor autosave behavior.
    pub async fn save(&self, id: &str, content: String) -> Result<Note, NoteError> {
        self.note_path(id)?;
        fs::create_dir_all(&self.folder).await?;
        self.write_note(id, content).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), NoteError> {
        let file_path = self.note_path(id)?;
        if !file_path.exists() {
            return Err(NoteError::NotFound(id.to_string()));
        }
        fs::remove_file(&file_path).await?;
        Ok(())
    }

    pub async fn append(&self, id: &str, fragment: &str) -> Result<Note, NoteError> {
        let existing = self.read(id).await?;
        let combined = format!("{}\n{}", existing.content, fragment);
        self.save(id, combined).await
    }

    async fn write_note(&self, id: &str, content: String) -> Result<Note, NoteError> {
        let file_path = self.note_path(id)?;
        fs::write(&file_path, &content).await?;
        let metadata = fs::metadata(&file_path).await?;

        Ok(Note {
            id: id.to_string(),
            title: extract_title(&content),
            content,
            path: file_path.to_string_lossy().into_owned(),
            modified: modified_unix_secs(&metadata),
        })
    }

    fn unique_id(&self, base: &str) -> String {
        let mut id = base.to_string();
        let mut counter = 1;
        while self.folder.join(format!("{id}.md")).exists() {
            id = format!("{base}-{counter}");
            counter += 1;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_and_read() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        let note = store
            .create(Some("# Mitosis\n\nCell division notes.".to_string()))
            .await
            .unwrap();
        assert_eq!(note.id, "Mitosis");
        assert_eq!(note.title, "Mitosis");

        let read = store.read("Mitosis").await.unwrap();
        assert_eq!(read.content, "# Mitosis\n\nCell division notes.");
    }

    #[tokio::test]
    async fn test_create_without_content_seeds_untitled() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        let first = store.create(None).await.unwrap();
        let second = store.create(None).await.unwrap();
        assert_eq!(first.id, "untitled");
        assert_eq!(second.id, "untitled-1");
        assert_eq!(first.title, "Untitled");
    }

    #[tokio::test]
    async fn test_duplicate_titles_get_suffixes() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        let a = store.create(Some("# Same\n\na".to_string())).await.unwrap();
        let b = store.create(Some("# Same\n\nb".to_string())).await.unwrap();
        assert_eq!(a.id, "Same");
        assert_eq!(b.id, "Same-1");
    }

    #[tokio::test]
    async fn test_read_missing_note() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());
        assert!(matches!(
            store.read("nope").await,
            Err(NoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        let note = store.create(None).await.unwrap();
        store.delete(&note.id).await.unwrap();
        assert!(matches!(
            store.read(&note.id).await,
            Err(NoteError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&note.id).await,
            Err(NoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_extends_content() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        let note = store
            .create(Some("# Log\n\nfirst".to_string()))
            .await
            .unwrap();
        let updated = store.append(&note.id, "second").await.unwrap();
        assert!(updated.content.ends_with("first\nsecond"));
    }

    #[tokio::test]
    async fn test_list_ignores_non_markdown() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        store.create(Some("# One\n\nx".to_string())).await.unwrap();
        std::fs::write(dir.path().join("data.json"), "{}").unwrap();

        let notes = store.list().await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "One");
    }

    #[tokio::test]
    async fn test_path_escaping_ids_rejected() {
        let dir = tempdir().unwrap();
        let store = NoteStore::new(dir.path());

        for id in ["../escape", "a/b", "a\\b", "", ".hidden"] {
            assert!(
                matches!(store.read(id).await, Err(NoteError::InvalidId(_))),
                "id {id:?} should be rejected"
            );
        }
    }
}
