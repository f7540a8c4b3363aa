use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::notes::NoteMetadata;
use crate::{extract_title, generate_preview, modified_unix_secs, AppState};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Keeps the notify watcher alive for the life of the app.
pub struct NotesWatcher {
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
}

/// Watch the configured notes folder and mirror file changes into the
/// search index and metadata cache. External editors write these files
/// too, so the index cannot rely on the HTTP handlers alone.
pub fn start(state: &Arc<AppState>) -> Result<()> {
    let Some(store) = state.note_store() else {
        tracing::info!("notes folder not set, watcher idle");
        return Ok(());
    };
    let folder = store.folder().to_path_buf();
    if !folder.exists() {
        std::fs::create_dir_all(&folder)?;
    }

    // Weak: the watcher lives inside AppState, so a strong handle here
    // would keep the state alive through its own field.
    let weak: Weak<AppState> = Arc::downgrade(state);
    let debounce: Arc<Mutex<HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            let Some(state) = weak.upgrade() else {
                return;
            };

            for path in event.paths.iter() {
                if !path.extension().is_some_and(|ext| ext == "md") {
                    continue;
                }

                {
                    let mut map = debounce.lock().expect("debounce map mutex");
                    let now = Instant::now();
                    if map.len() > 100 {
                        map.retain(|_, last| now.duration_since(*last) < Duration::from_secs(5));
                    }
                    if let Some(last) = map.get(path) {
                        if now.duration_since(*last) < DEBOUNCE_WINDOW {
                            continue;
                        }
                    }
                    map.insert(path.clone(), now);
                }

                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => reindex(&state, path),
                    EventKind::Remove(_) => deindex(&state, path),
                    _ => {}
                }
            }
        },
        Config::default(),
    )?;

    watcher.watch(&folder, RecursiveMode::NonRecursive)?;
    tracing::info!(folder = %folder.display(), "watching notes folder");

    let mut slot = state.watcher.lock().expect("watcher mutex");
    *slot = Some(NotesWatcher { watcher });
    Ok(())
}

/// Drop any running watcher and start over, e.g. after the notes folder
/// setting changed.
pub fn restart(state: &Arc<AppState>) -> Result<()> {
    {
        let mut slot = state.watcher.lock().expect("watcher mutex");
        *slot = None;
    }
    start(state)
}

fn note_id(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

fn reindex(state: &AppState, path: &Path) {
    let Some(id) = note_id(path) else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };

    let title = extract_title(&content);
    let modified = std::fs::metadata(path)
        .map(|m| modified_unix_secs(&m))
        .unwrap_or(0);

    {
        let index = state.search.lock().expect("search index mutex");
        if let Some(ref index) = *index {
            if let Err(err) = index.upsert(&id, &title, &content, modified) {
                tracing::warn!(%err, id, "reindex after file change failed");
            }
        }
    }

    let mut cache = state.note_cache.write().expect("cache write lock");
    cache.insert(
        id.clone(),
        NoteMetadata {
            id,
            title,
            preview: generate_preview(&content),
            modified,
        },
    );
}

fn deindex(state: &AppState, path: &Path) {
    let Some(id) = note_id(path) else {
        return;
    };

    {
        let index = state.search.lock().expect("search index mutex");
        if let Some(ref index) = *index {
            if let Err(err) = index.remove(&id) {
                tracing::warn!(%err, id, "deindex after file removal failed");
            }
        }
    }

    let mut cache = state.note_cache.write().expect("cache write lock");
    cache.remove(&id);
}
