//! Script generation from a natural-language question.
//!
//! Generators only ever see file manifests (names, aliases, formats, sizes),
//! never file contents. Generated scripts go through the same execution path
//! as user-written ones.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sandbox::GuestLanguage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CodegenConfig;
use crate::error::{EngineError, EngineResult};
use crate::resolver::FileDescription;

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a script answering `question` over `files`.
    async fn generate(
        &self,
        question: &str,
        language: GuestLanguage,
        files: &[FileDescription],
    ) -> EngineResult<String>;
}

pub fn build_prompt(question: &str, language: GuestLanguage, files: &[FileDescription]) -> String {
    let mut context = String::new();
    for f in files {
        let _ = writeln!(context, "- Name: `{}`", f.alias);
        let _ = writeln!(context, "  File: {} ({}, {} bytes)", f.name, f.format_hint.as_str(), f.byte_size);
    }

    let rules = match language {
        GuestLanguage::Python => {
            "1. Provide ONLY the raw python code.\n\
             2. Load each file with `read_table(\"<name>\")` using the names listed above. \
             `read_frame(\"<name>\")` returns a pandas DataFrame when pandas is available.\n\
             3. Do NOT open other paths, use the network, or create your own data.\n\
             4. Column values may be strings; convert them before doing arithmetic.\n\
             5. Assign the final table that answers the question to a variable named `result`.\n\
             6. DO NOT include comments, explanations, or function definitions.\n\
             7. DO NOT visualize the data.\n\
             8. Keep the code compact: no blank lines within a logical step."
        }
        GuestLanguage::Sql => {
            "1. Provide ONLY one raw SQLite SELECT statement.\n\
             2. Each file is a table named exactly as listed above.\n\
             3. Do NOT modify data: no INSERT, UPDATE, DELETE, CREATE, or ATTACH.\n\
             4. Column values may be text; CAST them before doing arithmetic.\n\
             5. DO NOT include comments or explanations."
        }
    };

    format!(
        "You are an expert {lang} data analyst. A user wants to answer the question: \"{question}\".\n\n\
         You have access to ONLY the following files:\n{context}\n\
         Write a short, clean {lang} script that produces the final data table answering the question.\n\n\
         --- STRICT RESPONSE RULES ---\n{rules}\n",
        lang = language.as_str(),
    )
}

/// Strip markdown code fences from a model response.
pub fn clean_response(text: &str) -> String {
    let mut out = Vec::new();
    for line in text.trim().lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        out.push(line);
    }
    out.join("\n").trim().to_string()
}

/// Gemini `generateContent` client. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct GeminiGenerator {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiGenerator {
    pub fn new(endpoint: &str, model: &str, api_key: String, timeout: Duration) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::CodeGen(format!("http client: {e}")))?;

        info!(endpoint, model, "gemini generator initialized");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                model: model.to_string(),
                api_key,
            }),
        })
    }

    /// Build from config, reading the API key from the configured variable.
    pub fn from_config(config: &CodegenConfig) -> EngineResult<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| EngineError::CodeGen(format!("{} is not set", config.api_key_env)))?;
        Self::new(
            &config.endpoint,
            &config.model,
            api_key,
            Duration::from_millis(config.timeout_ms),
        )
    }

    async fn complete(&self, prompt: &str) -> EngineResult<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.inner.endpoint, self.inner.model
        );
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };
        let resp = self
            .inner
            .client
            .post(url)
            .header("x-goog-api-key", &self.inner.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::CodeGen(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!(%status, body = %text, "gemini request rejected");
            return Err(EngineError::CodeGen(format!("model returned {status}")));
        }

        let decoded: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::CodeGen(format!("decode response: {e}")))?;
        let text: String = decoded
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();
        if text.trim().is_empty() {
            return Err(EngineError::CodeGen("model returned no text".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl CodeGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        question: &str,
        language: GuestLanguage,
        files: &[FileDescription],
    ) -> EngineResult<String> {
        if files.is_empty() {
            return Err(EngineError::CodeGen("no files selected for analysis".into()));
        }
        let prompt = build_prompt(question, language, files);
        let raw = self.complete(&prompt).await?;
        Ok(clean_response(&raw))
    }
}
