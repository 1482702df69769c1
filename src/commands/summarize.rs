use crate::commands::settings::{SummarizerConfig, SummarizerProvider};
use crate::error::{Error, Result};
use crate::models::features::DiffFeatureSummary;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

const SYSTEM_PROMPT: &str = "You review a developer's daily git diff. Reply with a single JSON object \
    {\"score_ai\": <integer 0-100 rating meaningful progress>, \"markdown\": \"<short markdown summary>\"} \
    and nothing else.";
const CHUNK_PROMPT: &str = "You are reading one part of a larger git diff. Reply with terse markdown \
    bullet notes describing what changed. Do not rate it.";

/// Metrics passed alongside the diff so the summary can reference them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryContext {
    pub date: String,
    pub insertions: i64,
    pub deletions: i64,
    pub raw_score: i64,
    pub local_score: i64,
    pub progress_percent: i64,
    pub features: DiffFeatureSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub text: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub chunks_count: Option<i64>,
}

/// Response text split into its score and markdown parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSummary {
    pub score_ai: Option<i64>,
    pub markdown: String,
    pub structured: bool,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn summarize(&self, diff: &str, context: &SummaryContext) -> Result<SummaryResponse>;

    /// Summarize a diff too large for one request. Providers without a
    /// chunked mode report an error so callers fall back to `summarize`.
    async fn summarize_chunked(
        &self,
        _diff: &str,
        _context: &SummaryContext,
    ) -> Result<SummaryResponse> {
        Err(Error::Summarize(format!(
            "{} does not support chunked summaries",
            self.provider_name()
        )))
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    chunk_chars: usize,
}

impl OpenAiSummarizer {
    pub fn from_config(config: &SummarizerConfig) -> Result<Self> {
        let api_key = read_env_non_empty(&config.api_key_env).ok_or_else(|| {
            Error::Settings(format!("missing API key in ${}", config.api_key_env))
        })?;
        Ok(Self::new(
            config.endpoint.clone(),
            config.model.clone(),
            api_key,
            config.chunk_chars,
        ))
    }

    pub fn new(endpoint: String, model: String, api_key: String, chunk_chars: usize) -> Self {
        OpenAiSummarizer {
            client: reqwest::Client::new(),
            endpoint,
            model,
            api_key,
            chunk_chars: chunk_chars.max(1),
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<(String, Option<i64>)> {
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });

        let response: Value = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Summarize("missing choices[0].message.content".to_string()))?
            .to_string();
        let tokens = response.pointer("/usage/total_tokens").and_then(Value::as_i64);
        Ok((text, tokens))
    }

    fn response(&self, text: String, tokens: Option<i64>, started: Instant, chunks: usize) -> SummaryResponse {
        SummaryResponse {
            text,
            model: Some(self.model.clone()),
            provider: Some(self.provider_name().to_string()),
            tokens,
            duration_ms: Some(started.elapsed().as_millis() as i64),
            chunks_count: Some(chunks as i64),
        }
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn summarize(&self, diff: &str, context: &SummaryContext) -> Result<SummaryResponse> {
        let started = Instant::now();
        let prompt = build_prompt(truncate_chars(diff, self.chunk_chars), context);
        let (text, tokens) = self.chat(SYSTEM_PROMPT, &prompt).await?;
        Ok(self.response(text, tokens, started, 1))
    }

    async fn summarize_chunked(&self, diff: &str, context: &SummaryContext) -> Result<SummaryResponse> {
        let chunks = split_diff_chunks(diff, self.chunk_chars);
        if chunks.len() <= 1 {
            return self.summarize(diff, context).await;
        }

        let started = Instant::now();
        let mut notes = Vec::with_capacity(chunks.len());
        let mut tokens: Option<i64> = None;
        for (index, chunk) in chunks.iter().enumerate() {
            log::debug!("summarizing diff chunk {}/{}", index + 1, chunks.len());
            let (note, used) = self.chat(CHUNK_PROMPT, chunk).await?;
            notes.push(note);
            tokens = add_tokens(tokens, used);
        }

        let prompt = build_prompt(&notes.join("\n\n"), context);
        let (text, used) = self.chat(SYSTEM_PROMPT, &prompt).await?;
        tokens = add_tokens(tokens, used);
        Ok(self.response(text, tokens, started, chunks.len()))
    }
}

/// Renders a markdown summary from metrics alone, without any network call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSummarizer;

#[async_trait]
impl Summarizer for LocalSummarizer {
    fn provider_name(&self) -> &str {
        "local"
    }

    async fn summarize(&self, _diff: &str, context: &SummaryContext) -> Result<SummaryResponse> {
        Ok(SummaryResponse {
            text: render_local_markdown(context),
            provider: Some(self.provider_name().to_string()),
            ..SummaryResponse::default()
        })
    }
}

pub fn build_summarizer(config: &SummarizerConfig) -> Arc<dyn Summarizer> {
    let want_remote = match config.provider {
        SummarizerProvider::Local => false,
        SummarizerProvider::OpenAi => true,
        SummarizerProvider::Auto => read_env_non_empty(&config.api_key_env).is_some(),
    };
    if !want_remote {
        return Arc::new(LocalSummarizer);
    }

    match OpenAiSummarizer::from_config(config) {
        Ok(summarizer) => Arc::new(summarizer),
        Err(e) => {
            log::warn!("falling back to local summaries: {e}");
            Arc::new(LocalSummarizer)
        }
    }
}

/// Parse `{score_ai, markdown}` out of a provider reply. Anything else is
/// kept verbatim as markdown without a score.
pub fn parse_summary_text(text: &str) -> ParsedSummary {
    let trimmed = strip_code_fence(text.trim());

    let structured = serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|value| structured_summary(&value))
        .or_else(|| {
            let start = trimmed.find('{')?;
            let end = trimmed.rfind('}')?;
            if end <= start {
                return None;
            }
            serde_json::from_str::<Value>(&trimmed[start..=end])
                .ok()
                .and_then(|value| structured_summary(&value))
        });

    structured.unwrap_or_else(|| ParsedSummary {
        score_ai: None,
        markdown: trimmed.to_string(),
        structured: false,
    })
}

fn structured_summary(value: &Value) -> Option<ParsedSummary> {
    let markdown = value.get("markdown")?.as_str()?.trim().to_string();
    let score_ai = value
        .get("score_ai")
        .and_then(|score| {
            score
                .as_f64()
                .or_else(|| score.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        })
        .filter(|score| score.is_finite())
        .map(|score| score.round().clamp(0.0, 100.0) as i64);
    Some(ParsedSummary {
        score_ai,
        markdown,
        structured: true,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

pub fn render_local_markdown(context: &SummaryContext) -> String {
    let f = &context.features;
    if f.is_empty() && context.insertions == 0 && context.deletions == 0 {
        return format!("## {}\n\nNo changes recorded since midnight.\n", context.date);
    }

    let mut out = format!("## {}\n\n", context.date);
    out.push_str(&format!(
        "- **Changed lines:** +{} / -{}\n",
        context.insertions, context.deletions
    ));
    out.push_str(&format!(
        "- **Files:** {} ({} code, {} test, {} docs, {} config)\n",
        f.total_files, f.code_files, f.test_files, f.doc_files, f.config_files
    ));
    out.push_str(&format!("- **Hunks:** {}\n", f.hunks));
    out.push_str(&format!(
        "- **Local score:** {}/100 (raw {})\n",
        context.local_score, context.raw_score
    ));

    if !f.extensions.is_empty() {
        let mut extensions: Vec<(&String, &usize)> = f.extensions.iter().collect();
        extensions.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let listed: Vec<String> = extensions
            .iter()
            .map(|(ext, count)| format!("{ext} ({count})"))
            .collect();
        out.push_str(&format!("- **Extensions:** {}\n", listed.join(", ")));
    }

    if let Some(symbols) = f.symbols.as_ref().filter(|s| s.total() > 0) {
        out.push_str(&format!(
            "- **Symbols added:** {} functions, {} classes, {} exports\n",
            symbols.functions, symbols.classes, symbols.exports
        ));
    }
    if f.renames > 0 {
        out.push_str(&format!("- **Renames:** {}\n", f.renames));
    }
    if f.dependency_changes {
        out.push_str("- Dependency manifests changed\n");
    }
    if f.security_sensitive {
        out.push_str("- Security-sensitive paths touched\n");
    }
    out
}

fn build_prompt(diff: &str, context: &SummaryContext) -> String {
    let f = &context.features;
    format!(
        "Date: {date}\nInsertions: {ins}\nDeletions: {del}\nFiles: {files} ({code} code, {tests} test, \
         {docs} docs, {config} config)\nHunks: {hunks}\nLocal score: {local}/100\nProgress so far: {progress}%\n\n\
         Diff:\n{diff}",
        date = context.date,
        ins = context.insertions,
        del = context.deletions,
        files = f.total_files,
        code = f.code_files,
        tests = f.test_files,
        docs = f.doc_files,
        config = f.config_files,
        hunks = f.hunks,
        local = context.local_score,
        progress = context.progress_percent,
    )
}

/// Split a diff into chunks of at most `limit` bytes, breaking between file
/// sections where possible and between lines otherwise.
pub fn split_diff_chunks(diff: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut sections: Vec<String> = Vec::new();
    for line in diff.split_inclusive('\n') {
        match sections.last_mut() {
            Some(current) if !line.starts_with("diff --git ") => current.push_str(line),
            _ => sections.push(line.to_string()),
        }
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for section in sections {
        if section.len() > limit {
            for line in section.split_inclusive('\n') {
                if !current.is_empty() && current.len() + line.len() > limit {
                    chunks.push(std::mem::take(&mut current));
                }
                current.push_str(line);
            }
            continue;
        }
        if !current.is_empty() && current.len() + section.len() > limit {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&section);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

fn add_tokens(total: Option<i64>, used: Option<i64>) -> Option<i64> {
    match (total, used) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

fn read_env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
