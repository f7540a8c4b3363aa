use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

use crate::notes::NoteMetadata;
use crate::{extract_title, generate_preview, modified_unix_secs};

/// A scored search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub modified: i64,
    pub score: f32,
}

// ── Tantivy index ──────────────────────────────────────────────────────────

pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    id_field: Field,
    title_field: Field,
    content_field: Field,
    modified_field: Field,
}

impl SearchIndex {
    /// Create or open the index directory.
    pub fn open(index_path: &Path) -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let title_field = schema_builder.add_text_field("title", TEXT | STORED);
        let content_field = schema_builder.add_text_field("content", TEXT | STORED);
        let modified_field = schema_builder.add_i64_field("modified", INDEXED | STORED);
        let schema = schema_builder.build();

        std::fs::create_dir_all(index_path)?;
        let index =
            Index::create_in_dir(index_path, schema).or_else(|_| Index::open_in_dir(index_path))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        let writer = index.writer(50_000_000)?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            id_field,
            title_field,
            content_field,
            modified_field,
        })
    }

    /// Index a note, replacing any previous document with the same id.
    pub fn upsert(&self, id: &str, title: &str, content: &str, modified: i64) -> Result<()> {
        {
            let mut writer = self.writer.lock().expect("search writer mutex");
            writer.delete_term(tantivy::Term::from_field_text(self.id_field, id));
            writer.add_document(doc!(
                self.id_field => id,
                self.title_field => title,
                self.content_field => content,
                self.modified_field => modified,
            ))?;
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut writer = self.writer.lock().expect("search writer mutex");
            writer.delete_term(tantivy::Term::from_field_text(self.id_field, id));
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    /// Query title and content. An unparseable query falls back to a
    /// prefix query so half-typed words still match.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let searcher = self.reader.searcher();
        let query_parser =
            QueryParser::for_index(&self.index, vec![self.title_field, self.content_field]);

        let query = query_parser
            .parse_query(query_str)
            .or_else(|_| query_parser.parse_query(&format!("{}*", query_str)))?;

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;

            let text_value = |field: Field| {
                doc.get_first(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };

            let content = text_value(self.content_field);

            results.push(SearchResult {
                id: text_value(self.id_field),
                title: text_value(self.title_field),
                preview: generate_preview(&content),
                modified: doc
                    .get_first(self.modified_field)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                score,
            });
        }

        Ok(results)
    }

    /// Drop everything and re-index the notes folder from disk.
    pub fn rebuild(&self, notes_folder: &Path) -> Result<()> {
        {
            let mut writer = self.writer.lock().expect("search writer mutex");
            writer.delete_all_documents()?;

            if notes_folder.exists() {
                for entry in std::fs::read_dir(notes_folder)?.flatten() {
                    let file_path = entry.path();
                    if !file_path.extension().is_some_and(|ext| ext == "md") {
                        continue;
                    }
                    let Ok(content) = std::fs::read_to_string(&file_path) else {
                        continue;
                    };

                    let id = file_path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("unknown");
                    let modified = entry
                        .metadata()
                        .map(|m| modified_unix_secs(&m))
                        .unwrap_or(0);

                    writer.add_document(doc!(
                        self.id_field => id,
                        self.title_field => extract_title(&content),
                        self.content_field => content.as_str(),
                        self.modified_field => modified,
                    ))?;
                }
            }

            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }
}

// ── Fallback search ────────────────────────────────────────────────────────

/// Substring scan over the metadata cache for when the index is missing.
pub fn fallback_search(
    cache: &HashMap<String, NoteMetadata>,
    query: &str,
    limit: usize,
) -> Vec<SearchResult> {
    let query_lower = query.to_lowercase();

    let mut results: Vec<SearchResult> = cache
        .values()
        .filter_map(|note| {
            let mut score = 0.0f32;
            if note.title.to_lowercase().contains(&query_lower) {
                score += 50.0;
            }
            if note.preview.to_lowercase().contains(&query_lower) {
                score += 10.0;
            }

            (score > 0.0).then(|| SearchResult {
                id: note.id.clone(),
                title: note.title.clone(),
                preview: note.preview.clone(),
                modified: note.modified,
                score,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    results
}
