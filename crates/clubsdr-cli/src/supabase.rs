//! Supabase PostgREST adapters: vector search, lead table and knowledge rows

use async_trait::async_trait;
use clubsdr_agent::{Error as AgentError, LeadRecord, LeadStore, Passage, Retriever};
use clubsdr_ai::providers::openai::OpenAIProvider;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Table holding one row per lead
pub const LEADS_TABLE: &str = "leads_sdr";
/// Table holding embedded knowledge chunks
pub const KNOWLEDGE_TABLE: &str = "conhecimento_clube";
/// Similarity search function
pub const MATCH_FUNCTION: &str = "match_documents";

/// Errors talking to Supabase
#[derive(Error, Debug)]
pub enum SupabaseError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Supabase returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[from] clubsdr_ai::Error),
}

pub type Result<T> = std::result::Result<T, SupabaseError>;

/// Minimal PostgREST client
pub struct SupabaseClient {
    client: reqwest::Client,
    url: String,
    key: String,
}

impl SupabaseClient {
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            key: key.into(),
        }
    }

    /// Full URL of a REST path such as `rpc/match_documents`
    pub fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.url, path.trim_start_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.rest_url(path))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    /// Call a Postgres function
    pub async fn rpc<T: DeserializeOwned>(
        &self,
        function: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let response = self
            .post(&format!("rpc/{}", function))
            .json(body)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Insert rows into a table
    pub async fn insert<R: Serialize>(&self, table: &str, rows: &[R]) -> Result<()> {
        let response = self
            .post(table)
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Insert rows, merging with existing rows on `on_conflict`
    pub async fn upsert<R: Serialize>(
        &self,
        table: &str,
        on_conflict: &str,
        rows: &[R],
    ) -> Result<()> {
        let response = self
            .post(&format!("{}?on_conflict={}", table, on_conflict))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SupabaseError::Status { status, body })
}

/// OpenAI embeddings for queries and chunks
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<OpenAIProvider>,
    base_url: String,
    model_id: String,
}

impl Embedder {
    pub fn new(
        provider: Arc<OpenAIProvider>,
        base_url: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            base_url: base_url.into(),
            model_id: model_id.into(),
        }
    }

    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .provider
            .embed(&self.base_url, &self.model_id, inputs)
            .await?)
    }
}

/// Body of the `match_documents` call
pub fn match_request(embedding: &[f32], threshold: f32, count: usize) -> serde_json::Value {
    serde_json::json!({
        "query_embedding": embedding,
        "match_threshold": threshold,
        "match_count": count,
    })
}

/// A row returned by `match_documents`
#[derive(Debug, Clone, Deserialize)]
pub struct MatchRow {
    pub conteudo: String,
    #[serde(default)]
    pub similarity: Option<f32>,
}

impl From<MatchRow> for Passage {
    fn from(row: MatchRow) -> Self {
        Passage {
            content: row.conteudo,
            similarity: row.similarity,
        }
    }
}

/// Semantic search over `conhecimento_clube`
pub struct SupabaseRetriever {
    supabase: Arc<SupabaseClient>,
    embedder: Embedder,
    match_threshold: f32,
    match_count: usize,
}

impl SupabaseRetriever {
    pub fn new(
        supabase: Arc<SupabaseClient>,
        embedder: Embedder,
        match_threshold: f32,
        match_count: usize,
    ) -> Self {
        Self {
            supabase,
            embedder,
            match_threshold,
            match_count,
        }
    }
}

#[async_trait]
impl Retriever for SupabaseRetriever {
    async fn search(&self, query: &str) -> clubsdr_agent::Result<Vec<Passage>> {
        let capability = |e: SupabaseError| AgentError::Capability(e.to_string());

        let embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(capability)?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Capability("no embedding returned".into()))?;

        let rows: Vec<MatchRow> = self
            .supabase
            .rpc(
                MATCH_FUNCTION,
                &match_request(&embedding, self.match_threshold, self.match_count),
            )
            .await
            .map_err(capability)?;

        tracing::debug!(query, matches = rows.len(), "Knowledge search");
        Ok(rows
            .into_iter()
            .filter(|row| !row.conteudo.trim().is_empty())
            .map(Passage::from)
            .collect())
    }
}

/// A row of `leads_sdr`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadRow<'a> {
    pub whatsapp_id: &'a str,
    pub nome_torcedor: &'a str,
    pub plano_interesse: &'a str,
    pub convertido: bool,
}

impl<'a> From<&'a LeadRecord> for LeadRow<'a> {
    fn from(record: &'a LeadRecord) -> Self {
        Self {
            whatsapp_id: &record.conversation_id,
            nome_torcedor: &record.name,
            plano_interesse: &record.plan,
            convertido: record.converted,
        }
    }
}

/// Lead store backed by `leads_sdr`, keyed by `whatsapp_id`
pub struct SupabaseLeadStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseLeadStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }
}

#[async_trait]
impl LeadStore for SupabaseLeadStore {
    async fn upsert(&self, record: &LeadRecord) -> clubsdr_agent::Result<()> {
        self.supabase
            .upsert(LEADS_TABLE, "whatsapp_id", &[LeadRow::from(record)])
            .await
            .map_err(|e| AgentError::Store(e.to_string()))
    }
}

/// A row of `conhecimento_clube`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeRow {
    pub categoria: String,
    pub conteudo: String,
    pub embedding: Vec<f32>,
    pub fonte_url: String,
}
