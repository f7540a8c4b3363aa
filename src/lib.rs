pub mod assistant;
pub mod extract;
pub mod notes;
pub mod search;
pub mod server;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::assistant::{SessionStore, StudyAssistant};
use crate::notes::{NoteMetadata, NoteStore};
use crate::search::SearchIndex;
use crate::watcher::NotesWatcher;

pub const APP_NAME: &str = "studypad";
pub const DEFAULT_SERVER_PORT: u16 = 3923;

// ── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub notes_folder: Option<String>,
    pub server_port: Option<u16>,
    pub assistant: AssistantSettings,
}

// Connection details for the completion endpoint the study tools call.
// The API key never lives in the settings file; `api_key_env` names the
// environment variable that holds it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantSettings {
    /// Full URL of an OpenAI-compatible chat completions route.
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    /// How many search hits to fold into chat context. Defaults to 4.
    pub max_context_notes: Option<usize>,
}

fn data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("platform data directory unavailable")?
        .join(APP_NAME);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn settings_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

pub fn search_index_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("search_index"))
}

pub fn load_settings() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(_) => return Settings::default(),
    };

    if path.exists() {
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let path = settings_path()?;
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

// ── Shared state ───────────────────────────────────────────────────────────

pub struct AppState {
    pub settings: RwLock<Settings>,
    pub note_cache: RwLock<HashMap<String, NoteMetadata>>,
    pub search: Mutex<Option<SearchIndex>>,
    pub watcher: Mutex<Option<NotesWatcher>>,
    pub assistant: StudyAssistant,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            note_cache: RwLock::new(HashMap::new()),
            search: Mutex::new(None),
            watcher: Mutex::new(None),
            assistant: StudyAssistant::new(),
            sessions: SessionStore::new(),
        }
    }

    /// The note store for the configured notes folder, if one is set.
    pub fn note_store(&self) -> Option<NoteStore> {
        let settings = self.settings.read().expect("settings read lock");
        settings.notes_folder.as_deref().map(NoteStore::new)
    }

    pub fn assistant_settings(&self) -> AssistantSettings {
        self.settings
            .read()
            .expect("settings read lock")
            .assistant
            .clone()
    }

    /// Open (or create) the search index and rebuild it from the notes
    /// folder. A failure leaves the fallback cache search in place.
    pub fn init_search(&self) {
        let Some(store) = self.note_store() else {
            return;
        };

        let index_path = match search_index_path() {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, "search index path unavailable");
                return;
            }
        };

        // Release the previous writer's directory lock before reopening.
        {
            let mut slot = self.search.lock().expect("search index mutex");
            *slot = None;
        }

        match SearchIndex::open(&index_path) {
            Ok(index) => {
                if let Err(err) = index.rebuild(store.folder()) {
                    tracing::warn!(%err, "search index rebuild failed");
                }
                let mut slot = self.search.lock().expect("search index mutex");
                *slot = Some(index);
            }
            Err(err) => {
                tracing::warn!(%err, "search index unavailable, using fallback search");
            }
        }
    }
}

// ── Note text utilities ────────────────────────────────────────────────────

/// True when a string holds nothing but whitespace and invisible padding
/// characters pasted in from rich-text sources.
pub(crate) fn is_effectively_empty(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_whitespace() || c == '\u{00A0}' || c == '\u{FEFF}')
}

/// Title of a note: the first `# ` heading, else the first non-empty line
/// clipped to 50 chars.
pub fn extract_title(content: &str) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let heading = heading.trim();
            if !is_effectively_empty(heading) {
                return heading.to_string();
            }
        }
        if !is_effectively_empty(trimmed) {
            return trimmed.chars().take(50).collect();
        }
    }
    "Untitled".to_string()
}

/// List preview: the first body line that is neither blank nor a heading,
/// clipped to 100 chars.
pub fn generate_preview(content: &str) -> String {
    content
        .lines()
        .skip(1)
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.chars().take(100).collect())
        .unwrap_or_default()
}

/// Turn a title into a filesystem-safe note id.
pub fn sanitize_filename(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .filter(|c| *c != '\u{00A0}' && *c != '\u{FEFF}')
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            _ => c,
        })
        .collect();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || is_effectively_empty(trimmed) {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Modification time of a file as unix seconds, zero if unavailable.
pub(crate) fn modified_unix_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title_from_heading() {
        assert_eq!(extract_title("# Photosynthesis\n\nbody"), "Photosynthesis");
    }

    #[test]
    fn test_extract_title_falls_back_to_first_line() {
        assert_eq!(extract_title("plain first line\nrest"), "plain first line");
    }

    #[test]
    fn test_extract_title_clips_long_lines() {
        let long = "x".repeat(80);
        assert_eq!(extract_title(&long).chars().count(), 50);
    }

    #[test]
    fn test_extract_title_empty_content() {
        assert_eq!(extract_title(""), "Untitled");
        assert_eq!(extract_title("   \n\u{00A0}\n"), "Untitled");
    }

    #[test]
    fn test_generate_preview_skips_headings() {
        let content = "# Title\n\n## Section\nFirst real line of text.";
        assert_eq!(generate_preview(content), "First real line of text.");
    }

    #[test]
    fn test_generate_preview_empty_body() {
        assert_eq!(generate_preview("# Title\n\n"), "");
    }

    #[test]
    fn test_sanitize_filename_replaces_separators() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a-b-c-d");
    }

    #[test]
    fn test_sanitize_filename_empty_title() {
        assert_eq!(sanitize_filename("  \u{FEFF} "), "untitled");
    }

    #[test]
    fn test_settings_round_trip_serde() {
        let mut settings = Settings::default();
        settings.notes_folder = Some("/tmp/notes".to_string());
        settings.assistant.model = Some("llama3".to_string());

        let text = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(back.notes_folder.as_deref(), Some("/tmp/notes"));
        assert_eq!(back.assistant.model.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_settings_tolerates_unknown_and_missing_fields() {
        let back: Settings = serde_json::from_str("{\"legacyField\": 1}").unwrap();
        assert!(back.notes_folder.is_none());
        assert!(back.assistant.endpoint.is_none());
    }
}
