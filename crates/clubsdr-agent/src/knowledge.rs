//! Knowledge retrieval and product search ports, and the tools that expose them to the model

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::tool::{Tool, ToolOutput};

/// Text returned to the model when a search yields nothing
pub const NOTHING_FOUND: &str = "No information found in the knowledge base.";

/// A retrieved passage of supporting text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    /// Similarity score reported by the index, when available
    #[serde(default)]
    pub similarity: Option<f32>,
}

impl Passage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            similarity: None,
        }
    }
}

/// Semantic search over the club knowledge base
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Ranked passages for `query`, best first
    async fn search(&self, query: &str) -> Result<Vec<Passage>>;
}

/// A plan, ticket or merchandise item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    /// "plan", "ticket" or "merchandise"
    pub category: String,
    pub price: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub benefits: Vec<String>,
}

impl Product {
    /// One-paragraph description handed to the model
    pub fn render(&self) -> String {
        let mut out = format!("{} ({}): {}", self.name, self.category, self.price);
        if !self.description.is_empty() {
            out.push_str(&format!("\n{}", self.description));
        }
        for benefit in &self.benefits {
            out.push_str(&format!("\n- {}", benefit));
        }
        out
    }

    fn haystack(&self) -> String {
        format!(
            "{} {} {} {}",
            self.name,
            self.category,
            self.description,
            self.benefits.join(" ")
        )
        .to_lowercase()
    }
}

/// Searchable catalog of products
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Product>>;
}

/// In-memory catalog with keyword matching
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    products: Vec<Product>,
}

impl StaticCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self { products }
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Products ranked by how many query words (3+ chars) they mention
    pub fn matching(&self, query: &str) -> Vec<Product> {
        let words: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 3)
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &Product)> = self
            .products
            .iter()
            .map(|p| {
                let haystack = p.haystack();
                (words.iter().filter(|w| haystack.contains(w.as_str())).count(), p)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl ProductCatalog for StaticCatalog {
    async fn search(&self, query: &str) -> Result<Vec<Product>> {
        Ok(self.matching(query))
    }
}

fn query_argument(arguments: &serde_json::Value) -> Option<&str> {
    arguments
        .get("query")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|q| !q.is_empty())
}

fn query_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": description
            }
        },
        "required": ["query"]
    })
}

/// `search_knowledge`: plan prices, benefits, rules and club facts
pub struct KnowledgeSearchTool {
    retriever: Arc<dyn Retriever>,
}

impl KnowledgeSearchTool {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "Search the club knowledge base for membership plan prices, benefits, rules, \
         match-day information and club history. Use it for any factual question."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("What to look up, phrased as a search query")
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
        let Some(query) = query_argument(&arguments) else {
            return ToolOutput::failed("query must not be empty");
        };
        match self.retriever.search(query).await {
            Ok(passages) if !passages.is_empty() => ToolOutput::found(
                passages
                    .into_iter()
                    .map(|p| p.content)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
            Ok(_) => ToolOutput::nothing_found(NOTHING_FOUND),
            Err(e) => {
                tracing::warn!(query, "knowledge search failed: {}", e);
                ToolOutput::nothing_found(NOTHING_FOUND)
            }
        }
    }
}

/// `search_products`: tickets, merchandise and plan listings
pub struct ProductSearchTool {
    catalog: Arc<dyn ProductCatalog>,
}

impl ProductSearchTool {
    pub fn new(catalog: Arc<dyn ProductCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Tool for ProductSearchTool {
    fn name(&self) -> &str {
        "search_products"
    }

    fn description(&self) -> &str {
        "Search the club store for match tickets, merchandise (shirts, scarves, caps) \
         and membership plan listings with prices."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("Product keywords, e.g. 'home shirt' or 'ticket'")
    }

    async fn execute(&self, arguments: serde_json::Value) -> ToolOutput {
        let Some(query) = query_argument(&arguments) else {
            return ToolOutput::failed("query must not be empty");
        };
        match self.catalog.search(query).await {
            Ok(products) if !products.is_empty() => ToolOutput::found(
                products
                    .iter()
                    .map(Product::render)
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
            Ok(_) => ToolOutput::nothing_found(NOTHING_FOUND),
            Err(e) => {
                tracing::warn!(query, "product search failed: {}", e);
                ToolOutput::nothing_found(NOTHING_FOUND)
            }
        }
    }
}
