//! Structured-output contracts for background analysis.
//!
//! Two jobs talk to the generation provider:
//!
//! - **Consolidation** reads one exchange plus the notes already stored and
//!   answers `{"notes": [{"scope": "user", "subject_id": "...", "text": "..."}]}`.
//! - **Message analysis** reads one message and answers
//!   `{"topic": "...", "sentiment": 0.4}`.
//!
//! Payloads are parsed strictly. Unknown fields, a missing user id or an
//! out-of-range score reject the whole payload as
//! [`ProviderError::Malformed`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::note::Scope;

/// Input to a generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Optional attachment (e.g. an image) passed through untouched.
    pub media: Option<Vec<u8>>,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            media: None,
        }
    }
}

/// External `prompt -> text` function.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<String, ProviderError>;
}

/// One fact the consolidation pass wants remembered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoteCommand {
    pub scope: Scope,
    /// Required for user notes. Server notes are filed under the
    /// conversation's server id.
    #[serde(default)]
    pub subject_id: Option<String>,
    pub text: String,
}

impl NoteCommand {
    /// `(scope, subject)` the note should be stored under.
    pub fn target(&self, server_id: &str) -> (Scope, String) {
        match self.scope {
            Scope::User => (Scope::User, self.subject_id.clone().unwrap_or_default()),
            Scope::Server => (Scope::Server, server_id.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsolidationPayload {
    notes: Vec<NoteCommand>,
}

/// Topic and sentiment of a single message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageAnalysis {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub sentiment: Option<f64>,
}

/// What the consolidation prompt is built from.
#[derive(Debug, Clone)]
pub struct ConsolidationInput<'a> {
    pub author_id: &'a str,
    pub author_name: &'a str,
    pub user_text: &'a str,
    pub reply_text: &'a str,
    pub user_notes: &'a [String],
    pub server_notes: &'a [String],
}

pub fn consolidation_prompt(input: &ConsolidationInput<'_>) -> String {
    format!(
        "You maintain the long-term memory of a conversational agent.\n\
         Read the exchange below and decide which durable facts are worth remembering.\n\
         Skip anything already listed under known facts.\n\
         \n\
         Answer with JSON only, in exactly this shape:\n\
         {{\"notes\": [{{\"scope\": \"user\", \"subject_id\": \"<user id>\", \"text\": \"<fact>\"}}, \
         {{\"scope\": \"server\", \"text\": \"<fact>\"}}]}}\n\
         Answer {{\"notes\": []}} when there is nothing new.\n\
         \n\
         Known facts about {name} ({id}): {user_notes}\n\
         Known facts about this server: {server_notes}\n\
         \n\
         {name} ({id}): {user_text}\n\
         Agent: {reply_text}\n",
        name = input.author_name,
        id = input.author_id,
        user_notes = join_or_none(input.user_notes),
        server_notes = join_or_none(input.server_notes),
        user_text = input.user_text,
        reply_text = input.reply_text,
    )
}

pub fn analysis_prompt(text: &str) -> String {
    format!(
        "Classify the message below.\n\
         Answer with JSON only: {{\"topic\": \"<one or two words, or null>\", \
         \"sentiment\": <number from -1.0 (very negative) to 1.0 (very positive)>}}\n\
         \n\
         Message: {}\n",
        text
    )
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join("; ")
    }
}

/// Parse a consolidation answer into validated note commands.
pub fn parse_consolidation(raw: &str) -> Result<Vec<NoteCommand>, ProviderError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ProviderError::Malformed("no JSON object in consolidation output".into()))?;
    let payload: ConsolidationPayload = serde_json::from_str(json)
        .map_err(|e| ProviderError::Malformed(format!("consolidation output: {}", e)))?;

    let mut commands = Vec::with_capacity(payload.notes.len());
    for mut command in payload.notes {
        command.text = command.text.trim().to_string();
        if command.text.is_empty() {
            return Err(ProviderError::Malformed("note with empty text".into()));
        }
        if command.scope == Scope::User {
            let has_subject = command
                .subject_id
                .as_deref()
                .map_or(false, |id| !id.trim().is_empty());
            if !has_subject {
                return Err(ProviderError::Malformed("user note without subject_id".into()));
            }
        }
        commands.push(command);
    }
    Ok(commands)
}

/// Parse a message-analysis answer.
///
/// A blank topic becomes `None`. Sentiment outside [-1, 1] is rejected.
pub fn parse_analysis(raw: &str) -> Result<MessageAnalysis, ProviderError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ProviderError::Malformed("no JSON object in analysis output".into()))?;
    let mut analysis: MessageAnalysis = serde_json::from_str(json)
        .map_err(|e| ProviderError::Malformed(format!("analysis output: {}", e)))?;

    analysis.topic = analysis
        .topic
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty());

    if let Some(score) = analysis.sentiment {
        if !(-1.0..=1.0).contains(&score) {
            return Err(ProviderError::Malformed(format!(
                "sentiment {} outside [-1, 1]",
                score
            )));
        }
    }
    Ok(analysis)
}

/// Ask the generator which facts to keep from an exchange.
pub async fn request_consolidation(
    generator: &dyn GenerationProvider,
    input: &ConsolidationInput<'_>,
) -> Result<Vec<NoteCommand>, ProviderError> {
    let raw = generator
        .generate(GenerationRequest::text(consolidation_prompt(input)))
        .await?;
    parse_consolidation(&raw)
}

/// Ask the generator for a message's topic and sentiment.
pub async fn request_analysis(
    generator: &dyn GenerationProvider,
    text: &str,
) -> Result<MessageAnalysis, ProviderError> {
    let raw = generator
        .generate(GenerationRequest::text(analysis_prompt(text)))
        .await?;
    parse_analysis(&raw)
}

/// First balanced `{...}` in a string that may carry surrounding prose or
/// a code fence.
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
