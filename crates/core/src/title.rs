use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

pub const FALLBACK_TITLE: &str = "Untitled Track";
pub const DEFAULT_TITLE_MODEL: &str = "llama3";
/// Enough context for a title without running into token limits.
pub const TITLE_CONTEXT_MAX_CHARS: usize = 1000;
const TITLE_MAX_CHARS: usize = 80;
const LYRICS_MIN_CHARS: usize = 10;

/// A text model available on the local assist endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    pub name: String,
}

/// Best-effort track-title generation. Every failure is absorbed by the
/// caller's fallback; nothing here may abort a job.
pub trait TitleAssist: Send + Sync {
    fn list_models(&self) -> Result<Vec<ModelEntry>>;
    fn generate_title(&self, context: &str, model: &str) -> Result<String>;
}

/// Client for an Ollama-compatible text endpoint.
///
/// Uses the blocking reqwest client: the scheduler invokes it from the
/// worker-thread pool, never from the async coordination context.
#[derive(Debug)]
pub struct OllamaTitleClient {
    base_url: Url,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaTitleClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid title assist base URL")?;
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid title assist endpoint path: {path}"))
    }
}

impl TitleAssist for OllamaTitleClient {
    fn list_models(&self) -> Result<Vec<ModelEntry>> {
        let url = self.url("api/tags")?;
        let response = self
            .client
            .get(url)
            .send()
            .context("failed to query local models")?;
        if !response.status().is_success() {
            bail!("model listing returned status {}", response.status());
        }
        let tags: TagsResponse = response.json().context("invalid model listing response")?;
        Ok(tags.models)
    }

    fn generate_title(&self, context: &str, model: &str) -> Result<String> {
        let url = self.url("api/generate")?;
        let prompt = format!(
            "Suggest a short, evocative song title for the following song. \
             Reply with the title only, no quotes, no explanation.\n\n{context}"
        );
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .context("failed to request title generation")?;
        if !response.status().is_success() {
            bail!("title generation returned status {}", response.status());
        }
        let generated: GenerateResponse =
            response.json().context("invalid title generation response")?;
        let title = clean_title(&generated.response);
        if title.is_empty() {
            bail!("title generation returned empty text");
        }
        Ok(title)
    }
}

/// Stand-in used when no assist endpoint is configured or reachable; every
/// call fails, which funnels jobs into the placeholder title.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTitleAssist;

impl TitleAssist for DisabledTitleAssist {
    fn list_models(&self) -> Result<Vec<ModelEntry>> {
        bail!("title assist is disabled")
    }

    fn generate_title(&self, _context: &str, _model: &str) -> Result<String> {
        bail!("title assist is disabled")
    }
}

/// Pick the context fed to the title model: lyrics when they carry enough
/// signal, otherwise the prompt, truncated to a safe length.
pub fn title_context(prompt: &str, lyrics: Option<&str>) -> String {
    let source = match lyrics {
        Some(lyrics) if lyrics.chars().count() > LYRICS_MIN_CHARS => lyrics,
        _ => prompt,
    };
    source.chars().take(TITLE_CONTEXT_MAX_CHARS).collect()
}

/// Resolve the final title: requested model first, else the first locally
/// available model, else the fixed default — and the fixed placeholder title
/// when everything fails.
pub fn resolve_title(
    assist: &dyn TitleAssist,
    context: &str,
    requested_model: Option<&str>,
) -> String {
    let model = match requested_model {
        Some(model) => model.to_string(),
        None => match assist.list_models() {
            Ok(models) => match models.first() {
                Some(first) => {
                    info!(model = %first.name, "No title model requested; using first local model");
                    first.name.clone()
                }
                None => {
                    warn!("No local models found; defaulting to '{DEFAULT_TITLE_MODEL}'");
                    DEFAULT_TITLE_MODEL.to_string()
                }
            },
            Err(err) => {
                warn!(error = %err, "Error fetching local models; defaulting to '{DEFAULT_TITLE_MODEL}'");
                DEFAULT_TITLE_MODEL.to_string()
            }
        },
    };

    match assist.generate_title(context, &model) {
        Ok(title) => title,
        Err(err) => {
            warn!(error = %err, "Auto-title generation failed; using default");
            FALLBACK_TITLE.to_string()
        }
    }
}

fn clean_title(raw: &str) -> String {
    let cleaned = raw
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    cleaned.chars().take(TITLE_MAX_CHARS).collect()
}
