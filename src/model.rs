//! Model capability: structured analysis requests and embeddings.
//!
//! Providers sit behind two narrow traits so the pipeline never knows which
//! backend is in use. The HTTP provider speaks the OpenAI-compatible chat
//! completions API and forces a tool call so the grouping decision comes
//! back as machine-checkable JSON. The heuristic provider works offline and
//! doubles as the terminal fallback when retries are exhausted.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse>;
}

pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub id: usize,
    pub files: Vec<String>,
    pub identifiers: Vec<String>,
    pub diff_fragments: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub groups: Vec<GroupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub cluster_strictness: f32,
    pub max_tokens: u32,
    /// Fingerprint of the input groups, logged for reproducibility.
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposedGroup {
    pub member_ids: Vec<usize>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisResponse {
    pub logical_groups: Vec<ProposedGroup>,
    #[serde(default)]
    pub order: Vec<usize>,
}

/// FNV-1a over arbitrary bytes; used for group fingerprints and request
/// seeds, which must be stable across runs and platforms.
pub fn fingerprint<'a, I: IntoIterator<Item = &'a [u8]>>(parts: I) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for part in parts {
        for &b in part {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat provider
// ---------------------------------------------------------------------------

static CLIENT: OnceLock<reqwest::blocking::Client> = OnceLock::new();

fn http_client() -> &'static reqwest::blocking::Client {
    CLIENT.get_or_init(|| {
        reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client")
    })
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct Function {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Tool {
    #[serde(rename = "type")]
    tool_type: String,
    function: Function,
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    tools: Vec<Tool>,
    tool_choice: serde_json::Value,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

const PLAN_FUNCTION: &str = "propose_commit_plan";

const SYSTEM_PROMPT: &str = "You group code changes into atomic commits. \
You receive semantic groups: sets of changes that must stay together. \
Merge related groups into logical commits and write a concise imperative \
commit message for each. Every input group id must appear in exactly one \
logical group. cluster_strictness 0 means one commit per group; 1 means \
merge aggressively. Respond only through the function call.";

fn plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "logical_groups": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "member_ids": {"type": "array", "items": {"type": "integer"}},
                        "message": {"type": "string"}
                    },
                    "required": ["member_ids", "message"]
                }
            },
            "order": {"type": "array", "items": {"type": "integer"}}
        },
        "required": ["logical_groups"]
    })
}

pub struct OpenAiProvider {
    pub model: String,
    pub api_base: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        let payload = ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: vec![Tool {
                tool_type: "function".to_string(),
                function: Function {
                    name: PLAN_FUNCTION.to_string(),
                    description: "Propose the logical commit plan".to_string(),
                    parameters: plan_schema(),
                },
            }],
            tool_choice: serde_json::json!({
                "type": "function",
                "function": {"name": PLAN_FUNCTION}
            }),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: serde_json::to_string(request)
                        .map_err(|e| Error::Model(e.to_string()))?,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let response = http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|e| Error::Model(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Model(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body: ApiResponse = response.json().map_err(|e| Error::Model(e.to_string()))?;

        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| Error::Model("response had no choices".to_string()))?;

        if let Some(call) = message.tool_calls.into_iter().next() {
            return parse_response(&call.function.arguments);
        }
        if let Some(content) = message.content {
            return parse_response(&content);
        }
        Err(Error::Model("response had neither tool call nor content".to_string()))
    }
}

/// Parse an `AnalysisResponse` out of model output. Tool-call arguments are
/// clean JSON; plain content may wrap it in prose or a code fence, so fall
/// back to carving out the outermost object and then fenced blocks.
pub fn parse_response(raw: &str) -> Result<AnalysisResponse> {
    fn try_parse(input: &str) -> Option<AnalysisResponse> {
        serde_json::from_str(input.trim()).ok()
    }

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Model("empty analysis response".to_string()));
    }
    if let Some(parsed) = try_parse(trimmed) {
        return Ok(parsed);
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Some(parsed) = try_parse(&trimmed[start..=end]) {
                return Ok(parsed);
            }
        }
    }
    for (idx, segment) in trimmed.split("```").enumerate() {
        if idx % 2 == 1 {
            let block = segment.trim();
            let candidate = block
                .strip_prefix("json")
                .map(str::trim)
                .unwrap_or(block);
            if let Some(parsed) = try_parse(candidate) {
                return Ok(parsed);
            }
        }
    }
    Err(Error::Model("could not parse analysis response".to_string()))
}

// ---------------------------------------------------------------------------
// Heuristic provider
// ---------------------------------------------------------------------------

/// Offline provider: buckets semantic groups by the top-level directory of
/// their first file, one logical commit per bucket, deterministic order.
pub struct HeuristicProvider;

pub fn heuristic_message(files: &[String]) -> String {
    format!("files touched: {}", files.join(", "))
}

fn top_dir(path: &str) -> String {
    match path.split('/').collect::<Vec<_>>().as_slice() {
        [] | [_] => "root".to_string(),
        [dir, ..] => dir.to_string(),
    }
}

impl ModelProvider for HeuristicProvider {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResponse> {
        let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut files: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for group in &request.groups {
            let key = group
                .files
                .first()
                .map(|f| top_dir(f))
                .unwrap_or_else(|| "root".to_string());
            buckets.entry(key.clone()).or_default().push(group.id);
            let entry = files.entry(key).or_default();
            for file in &group.files {
                if !entry.contains(file) {
                    entry.push(file.clone());
                }
            }
        }
        let logical_groups = buckets
            .into_iter()
            .map(|(key, member_ids)| ProposedGroup {
                member_ids,
                message: heuristic_message(&files[&key]),
            })
            .collect();
        Ok(AnalysisResponse {
            logical_groups,
            order: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

pub struct OpenAiEmbeddings {
    pub model: String,
    pub api_base: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

impl EmbeddingProvider for OpenAiEmbeddings {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let response = http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"model": self.model, "input": text}))
            .send()
            .map_err(|e| Error::Model(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Model(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body: EmbeddingResponse =
            response.json().map_err(|e| Error::Model(e.to_string()))?;
        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Model("embedding response had no data".to_string()))
    }
}

/// Deterministic offline embedding: a 64-bucket bag of words hashed with
/// FNV-1a, L2-normalized. Good enough for relevance ranking of diffs against
/// an intent string without any network dependency.
pub struct HashEmbeddings;

const HASH_DIMS: usize = 64;

impl EmbeddingProvider for HashEmbeddings {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; HASH_DIMS];
        for token in text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 1)
        {
            let lower = token.to_ascii_lowercase();
            let bucket = (fingerprint([lower.as_bytes()]) % HASH_DIMS as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }
}

/// Cosine similarity mapped from [-1, 1] into [0, 1].
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    ((dot / (na * nb)) + 1.0) / 2.0
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Build the model provider named by `provider:name`. A missing API key for
/// an HTTP provider degrades to the heuristic provider with a warning, so
/// offline runs still produce commits.
pub fn provider_for(
    spec: &str,
    api_key: Option<&str>,
    api_base: Option<&str>,
    temperature: f32,
    max_tokens: u32,
    logger: &slog::Logger,
) -> Result<Box<dyn ModelProvider>> {
    let (kind, name) = spec.split_once(':').unwrap_or((spec, ""));
    match kind {
        "heuristic" => Ok(Box::new(HeuristicProvider)),
        "openai" => {
            if name.is_empty() {
                return Err(Error::Usage(format!(
                    "model {:?} is missing a model name after the colon",
                    spec
                )));
            }
            match api_key {
                Some(key) => Ok(Box::new(OpenAiProvider {
                    model: name.to_string(),
                    api_base: api_base.unwrap_or(DEFAULT_API_BASE).to_string(),
                    api_key: key.to_string(),
                    temperature,
                    max_tokens,
                })),
                None => {
                    warn!(
                        logger,
                        "no API key configured, falling back to heuristic grouping";
                        "model" => spec,
                    );
                    Ok(Box::new(HeuristicProvider))
                }
            }
        }
        other => Err(Error::Usage(format!("unknown model provider {:?}", other))),
    }
}

/// Build the embedding provider. `custom_embedding_model` takes the same
/// `provider:name` shape; without one (or without a key) the hash backend is
/// used.
pub fn embedder_for(
    custom: Option<&str>,
    api_key: Option<&str>,
    api_base: Option<&str>,
) -> Result<Box<dyn EmbeddingProvider>> {
    match custom {
        Some(spec) => {
            let (kind, name) = spec.split_once(':').unwrap_or((spec, ""));
            match (kind, api_key) {
                ("hash", _) => Ok(Box::new(HashEmbeddings)),
                ("openai", Some(key)) if !name.is_empty() => Ok(Box::new(OpenAiEmbeddings {
                    model: name.to_string(),
                    api_base: api_base.unwrap_or(DEFAULT_API_BASE).to_string(),
                    api_key: key.to_string(),
                })),
                ("openai", None) => Ok(Box::new(HashEmbeddings)),
                _ => Err(Error::Usage(format!(
                    "unknown embedding model {:?}",
                    spec
                ))),
            }
        }
        None => Ok(Box::new(HashEmbeddings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let a = fingerprint([b"abc".as_slice(), b"def".as_slice()]);
        let b = fingerprint([b"abcdef".as_slice()]);
        assert_eq!(a, b);
        assert_ne!(a, fingerprint([b"abcdeg".as_slice()]));
    }

    #[test]
    fn parse_response_handles_clean_json() {
        let parsed = parse_response(
            r#"{"logical_groups": [{"member_ids": [0, 1], "message": "add parser"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.logical_groups.len(), 1);
        assert_eq!(parsed.logical_groups[0].member_ids, vec![0, 1]);
    }

    #[test]
    fn parse_response_unwraps_prose_and_fences() {
        let wrapped = "Here is the plan:\n```json\n{\"logical_groups\": [{\"member_ids\": [2], \"message\": \"fix tests\"}], \"order\": [0]}\n```\nDone.";
        let parsed = parse_response(wrapped).unwrap();
        assert_eq!(parsed.logical_groups[0].message, "fix tests");
        assert_eq!(parsed.order, vec![0]);
    }

    #[test]
    fn parse_response_rejects_garbage() {
        assert!(parse_response("no json here").is_err());
        assert!(parse_response("").is_err());
    }

    #[test]
    fn heuristic_buckets_by_top_directory() {
        let request = AnalysisRequest {
            groups: vec![
                GroupSummary {
                    id: 0,
                    files: vec!["src/a.rs".to_string()],
                    identifiers: vec![],
                    diff_fragments: vec![],
                },
                GroupSummary {
                    id: 1,
                    files: vec!["src/b.rs".to_string()],
                    identifiers: vec![],
                    diff_fragments: vec![],
                },
                GroupSummary {
                    id: 2,
                    files: vec!["docs/x.md".to_string()],
                    identifiers: vec![],
                    diff_fragments: vec![],
                },
            ],
            intent: None,
            cluster_strictness: 0.5,
            max_tokens: 1024,
            seed: 0,
        };
        let response = HeuristicProvider.analyze(&request).unwrap();
        assert_eq!(response.logical_groups.len(), 2);
        let src = response
            .logical_groups
            .iter()
            .find(|g| g.member_ids.contains(&0))
            .unwrap();
        assert_eq!(src.member_ids, vec![0, 1]);
        assert!(src.message.starts_with("files touched: "));
    }

    #[test]
    fn hash_embeddings_rank_related_text_higher() {
        let embedder = HashEmbeddings;
        let intent = embedder.embed("fix the parser error handling").unwrap();
        let related = embedder
            .embed("parser: recover from error tokens")
            .unwrap();
        let unrelated = embedder.embed("bump dependency versions").unwrap();
        assert!(similarity(&intent, &related) > similarity(&intent, &unrelated));
    }

    #[test]
    fn similarity_is_bounded() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(similarity(&a, &b).abs() < 1e-6);
    }
}
