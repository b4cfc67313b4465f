//! Product catalog loaded from TOML

use anyhow::Context as _;
use clubsdr_agent::{Product, StaticCatalog};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    products: Vec<Product>,
}

/// Parse catalog TOML (`[[products]]` tables)
pub fn parse_catalog(content: &str) -> anyhow::Result<StaticCatalog> {
    let file: CatalogFile = toml::from_str(content)?;
    Ok(StaticCatalog::new(file.products))
}

/// Load the catalog file, or an empty catalog when none is configured
pub fn load_catalog(path: Option<&Path>) -> anyhow::Result<StaticCatalog> {
    let Some(path) = path else {
        tracing::warn!("No catalog_file configured; product search will find nothing");
        return Ok(StaticCatalog::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog {}", path.display()))?;
    let catalog = parse_catalog(&content)
        .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
    tracing::info!(path = %path.display(), products = catalog.products().len(), "Loaded catalog");
    Ok(catalog)
}

/// Example catalog written by `init-config`
pub fn example_catalog() -> &'static str {
    r#"# clubsdr product catalog
# Replace these entries with the club's real plans, tickets and merchandise.

[[products]]
name = "Sócio Ouro"
category = "plan"
price = "R$ 89,90/month"
description = "Full membership plan."
benefits = ["Guaranteed seat at every home match", "20% off at the official store"]

[[products]]
name = "Sócio Prata"
category = "plan"
price = "R$ 49,90/month"
description = "Entry membership plan."
benefits = ["Ticket priority for home matches", "10% off at the official store"]

[[products]]
name = "Home match ticket"
category = "ticket"
price = "R$ 40,00"
description = "Single ticket for a home league match."

[[products]]
name = "Official home shirt"
category = "merchandise"
price = "R$ 249,90"
description = "Current season home shirt."
"#
}
