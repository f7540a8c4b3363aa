use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::extract::{extract_json_with_reasoning, strip_reasoning_blocks, ExtractionFailure};
use crate::AssistantSettings;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Note text beyond this is clipped before prompting; completion context
/// windows are finite and the tail of a long note rarely changes the
/// result.
const MAX_NOTE_CHARS: usize = 12_000;
/// Per-note excerpt budget when folding search hits into chat context.
const MAX_EXCERPT_CHARS: usize = 1_500;
/// Chat turns sent back to the endpoint per request.
const MAX_HISTORY_MESSAGES: usize = 12;

// ── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant endpoint is not configured")]
    NotConfigured,
    #[error("invalid assistant endpoint: {0}")]
    BadEndpoint(String),
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion endpoint returned status {status}: {detail}")]
    Endpoint { status: u16, detail: String },
    #[error("completion response had no message content")]
    EmptyCompletion,
    #[error(transparent)]
    Extraction(#[from] ExtractionFailure),
    #[error("{feature} response had unexpected shape: {reason}")]
    Shape {
        feature: &'static str,
        reason: String,
    },
    #[error("chat session not found: {0}")]
    SessionNotFound(String),
}

// ── Wire and domain types ──────────────────────────────────────────────────

/// One chat turn, in the shape the completions API expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSummary {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    /// Zero-based index into `options`.
    pub answer: usize,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mindmap {
    pub nodes: Vec<MindmapNode>,
    pub edges: Vec<MindmapEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindmapNode {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindmapEdge {
    pub from: String,
    pub to: String,
}

/// A note excerpt folded into the chat system prompt.
#[derive(Debug, Clone)]
pub struct NoteContext {
    pub title: String,
    pub excerpt: String,
}

// ── Prompts ────────────────────────────────────────────────────────────────

const SUMMARY_SYSTEM: &str = r#"You are a study assistant. Summarize the user's note.
Respond with a JSON object only, matching exactly:
{"summary": "<two to four sentence summary>", "keyPoints": ["<short key point>", "..."]}
Do not include any text outside the JSON object."#;

const FLASHCARD_SYSTEM: &str = r#"You are a study assistant that writes flashcards.
Respond with a JSON array only, matching exactly:
[{"front": "<question or term>", "back": "<answer or definition>"}, ...]
Each card tests one fact. Do not include any text outside the JSON array."#;

const QUIZ_SYSTEM: &str = r#"You are a study assistant that writes multiple-choice quizzes.
Respond with a JSON array only, matching exactly:
[{"question": "<text>", "options": ["<a>", "<b>", "<c>", "<d>"], "answer": <zero-based index of the correct option>, "explanation": "<one sentence>"}, ...]
Exactly one option is correct per question. Do not include any text outside the JSON array."#;

const MINDMAP_SYSTEM: &str = r#"You are a study assistant that builds mindmaps.
Respond with a JSON object only, matching exactly:
{"nodes": [{"id": "<short-id>", "label": "<concept>"}], "edges": [{"from": "<node id>", "to": "<node id>"}]}
The first node is the central topic. Every edge must reference node ids from the nodes list.
Do not include any text outside the JSON object."#;

fn note_prompt(task: &str, note: &str) -> String {
    format!("{task}\n\nNOTE:\n{}", clip(note, MAX_NOTE_CHARS))
}

fn chat_system(context: &[NoteContext]) -> String {
    let mut prompt = String::from(
        "You are a study assistant answering questions about the user's notes.\n\
         Ground every answer in the note excerpts below. If the notes do not \
         cover the question, say so instead of guessing.\n",
    );
    for note in context {
        prompt.push_str(&format!(
            "\n--- {} ---\n{}\n",
            note.title,
            clip(&note.excerpt, MAX_EXCERPT_CHARS)
        ));
    }
    prompt
}

/// Clip to a character budget without splitting a code point.
fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

// ── Completion client and feature handlers ─────────────────────────────────

/// The study features: each builds a prompt, calls the completion
/// endpoint, and recovers a structured result from the raw text.
pub struct StudyAssistant {
    http: reqwest::Client,
}

impl Default for StudyAssistant {
    fn default() -> Self {
        Self::new()
    }
}

impl StudyAssistant {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// One round trip to the chat completions endpoint; returns the raw
    /// assistant message text.
    async fn complete(
        &self,
        cfg: &AssistantSettings,
        messages: Vec<ChatMessage>,
    ) -> Result<String, AssistantError> {
        let endpoint = cfg.endpoint.as_deref().ok_or(AssistantError::NotConfigured)?;
        let endpoint =
            Url::parse(endpoint).map_err(|err| AssistantError::BadEndpoint(err.to_string()))?;
        let model = cfg.model.as_deref().unwrap_or(DEFAULT_MODEL);

        let message_count = messages.len();
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": cfg.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        });

        let mut request = self.http.post(endpoint).json(&body);
        if let Some(env_name) = cfg.api_key_env.as_deref() {
            if let Ok(key) = std::env::var(env_name) {
                request = request.bearer_auth(key.trim());
            }
        }

        tracing::debug!(model, message_count, "completion request");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AssistantError::Endpoint {
                status: status.as_u16(),
                detail: clip(detail.trim(), 300).to_string(),
            });
        }

        let envelope: Value = response.json().await?;
        completion_text(&envelope).ok_or(AssistantError::EmptyCompletion)
    }

    pub async fn summarize(
        &self,
        cfg: &AssistantSettings,
        note: &str,
    ) -> Result<NoteSummary, AssistantError> {
        let raw = self
            .complete(
                cfg,
                vec![
                    ChatMessage::system(SUMMARY_SYSTEM),
                    ChatMessage::user(note_prompt("Summarize this note.", note)),
                ],
            )
            .await?;

        // No envelope unwrapping here: the summary object itself carries a
        // "summary" key.
        let value = extract_json_with_reasoning(&raw)?;
        let summary: NoteSummary = parse_shape("summary", value)?;
        if summary.summary.trim().is_empty() {
            return Err(AssistantError::Shape {
                feature: "summary",
                reason: "empty summary text".to_string(),
            });
        }
        Ok(summary)
    }

    pub async fn flashcards(
        &self,
        cfg: &AssistantSettings,
        note: &str,
        count: usize,
    ) -> Result<Vec<Flashcard>, AssistantError> {
        let count = count.clamp(1, 50);
        let raw = self
            .complete(
                cfg,
                vec![
                    ChatMessage::system(FLASHCARD_SYSTEM),
                    ChatMessage::user(note_prompt(
                        &format!("Create {count} flashcards from this note."),
                        note,
                    )),
                ],
            )
            .await?;

        let value = unwrap_payload(extract_json_with_reasoning(&raw)?, "flashcards");
        let cards: Vec<Flashcard> = parse_shape("flashcards", value)?;
        if cards.is_empty() {
            return Err(AssistantError::Shape {
                feature: "flashcards",
                reason: "empty card list".to_string(),
            });
        }
        Ok(cards)
    }

    pub async fn quiz(
        &self,
        cfg: &AssistantSettings,
        note: &str,
        count: usize,
    ) -> Result<Vec<QuizQuestion>, AssistantError> {
        let count = count.clamp(1, 25);
        let raw = self
            .complete(
                cfg,
                vec![
                    ChatMessage::system(QUIZ_SYSTEM),
                    ChatMessage::user(note_prompt(
                        &format!("Write a {count}-question quiz from this note."),
                        note,
                    )),
                ],
            )
            .await?;

        let value = unwrap_payload(extract_json_with_reasoning(&raw)?, "questions");
        let questions: Vec<QuizQuestion> = parse_shape("quiz", value)?;
        validate_quiz(&questions)?;
        Ok(questions)
    }

    pub async fn mindmap(
        &self,
        cfg: &AssistantSettings,
        note: &str,
    ) -> Result<Mindmap, AssistantError> {
        let raw = self
            .complete(
                cfg,
                vec![
                    ChatMessage::system(MINDMAP_SYSTEM),
                    ChatMessage::user(note_prompt("Build a mindmap of this note.", note)),
                ],
            )
            .await?;

        let value = unwrap_payload(extract_json_with_reasoning(&raw)?, "mindmap");
        let map: Mindmap = parse_shape("mindmap", value)?;
        validate_mindmap(&map)?;
        Ok(map)
    }

    /// Answer a question grounded in note excerpts. Chat answers are
    /// prose, not JSON; only reasoning blocks are stripped.
    pub async fn chat(
        &self,
        cfg: &AssistantSettings,
        history: &[ChatMessage],
        question: &str,
        context: &[NoteContext],
    ) -> Result<String, AssistantError> {
        let recent = &history[history.len().saturating_sub(MAX_HISTORY_MESSAGES)..];

        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(ChatMessage::system(chat_system(context)));
        messages.extend(recent.iter().cloned());
        messages.push(ChatMessage::user(question));

        let raw = self.complete(cfg, messages).await?;
        let answer = strip_reasoning_blocks(&raw);
        if answer.is_empty() {
            return Err(AssistantError::EmptyCompletion);
        }
        Ok(answer)
    }
}

/// Pull the assistant message text out of a chat-completions envelope.
fn completion_text(envelope: &Value) -> Option<String> {
    envelope
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// Models often wrap the requested payload in an envelope object even
/// when told not to; accept `{"<key>": ...}` as well as the bare value.
fn unwrap_payload(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => map.remove(key).unwrap_or(Value::Object(map)),
        other => other,
    }
}

fn parse_shape<T: serde::de::DeserializeOwned>(
    feature: &'static str,
    value: Value,
) -> Result<T, AssistantError> {
    serde_json::from_value(value).map_err(|err| AssistantError::Shape {
        feature,
        reason: err.to_string(),
    })
}

fn validate_quiz(questions: &[QuizQuestion]) -> Result<(), AssistantError> {
    if questions.is_empty() {
        return Err(AssistantError::Shape {
            feature: "quiz",
            reason: "empty question list".to_string(),
        });
    }
    for (i, q) in questions.iter().enumerate() {
        if q.options.len() < 2 {
            return Err(AssistantError::Shape {
                feature: "quiz",
                reason: format!("question {i} has fewer than two options"),
            });
        }
        if q.answer >= q.options.len() {
            return Err(AssistantError::Shape {
                feature: "quiz",
                reason: format!(
                    "question {i} answer index {} out of range for {} options",
                    q.answer,
                    q.options.len()
                ),
            });
        }
    }
    Ok(())
}

fn validate_mindmap(map: &Mindmap) -> Result<(), AssistantError> {
    if map.nodes.is_empty() {
        return Err(AssistantError::Shape {
            feature: "mindmap",
            reason: "no nodes".to_string(),
        });
    }
    let ids: HashSet<&str> = map.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &map.edges {
        if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
            return Err(AssistantError::Shape {
                feature: "mindmap",
                reason: format!("edge {} -> {} references unknown node", edge.from, edge.to),
            });
        }
    }
    Ok(())
}

// ── Chat sessions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

/// Keyed session store with an explicit lifecycle: create, fetch, append
/// turns, evict by id, sweep idle sessions.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, ChatSession>>,
    counter: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn create(&self) -> ChatSession {
        let now = Utc::now();
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let session = ChatSession {
            id: format!("s-{}-{n}", now.timestamp_millis()),
            created_at: now,
            last_active: now,
            messages: Vec::new(),
        };

        let mut sessions = self.sessions.write().expect("session store write lock");
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<ChatSession> {
        let sessions = self.sessions.read().expect("session store read lock");
        sessions.get(id).cloned()
    }

    pub fn history(&self, id: &str) -> Result<Vec<ChatMessage>, AssistantError> {
        self.get(id)
            .map(|s| s.messages)
            .ok_or_else(|| AssistantError::SessionNotFound(id.to_string()))
    }

    pub fn append(&self, id: &str, message: ChatMessage) -> Result<(), AssistantError> {
        let mut sessions = self.sessions.write().expect("session store write lock");
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AssistantError::SessionNotFound(id.to_string()))?;
        session.messages.push(message);
        session.last_active = Utc::now();
        Ok(())
    }

    pub fn evict(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().expect("session store write lock");
        sessions.remove(id).is_some()
    }

    /// Remove sessions idle longer than `max_idle`; returns how many went.
    pub fn evict_idle(&self, max_idle: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_idle;
        let mut sessions = self.sessions.write().expect("session store write lock");
        let before = sessions.len();
        sessions.retain(|_, s| s.last_active > cutoff);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session store read lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
