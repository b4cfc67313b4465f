//! clubsdr - sales agent for a sports club

mod catalog;
mod config;
mod ingest;
mod server;
mod session;
mod supabase;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use clubsdr_agent::store::InMemoryLeadStore;
use clubsdr_agent::{
    Agent, AgentEvent, LeadStore, ProviderModel, Retriever, TurnRequest, TurnService,
};
use clubsdr_ai::providers::openai::OpenAIProvider;
use clubsdr_ai::{Model, Provider};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::supabase::{Embedder, SupabaseClient, SupabaseLeadStore, SupabaseRetriever};

/// clubsdr - membership sales agent
#[derive(Parser, Debug)]
#[command(name = "clubsdr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model to use (default: gpt-4o)
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Provider (openai, groq, openrouter, ollama)
    #[arg(short, long, global = true)]
    provider: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with the agent interactively (default)
    Chat {
        /// Resume a saved conversation
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Send a single message and print the reply
    Ask {
        message: String,
        /// Conversation to continue
        #[arg(long, default_value = "cli")]
        conversation: String,
        /// Print the reply and lead fields as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve POST /chat and GET /health
    Serve {
        /// Address to listen on (default: 0.0.0.0:8080)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Embed the .txt files of a directory into the knowledge table
    Ingest {
        #[arg(default_value = "./data/raw")]
        dir: PathBuf,
    },
    /// Print the turn graph as Mermaid
    Graph {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Create the config file and an example catalog
    InitConfig,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("clubsdr=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let command = args.command.unwrap_or(Command::Chat { conversation: None });

    // Commands that need no model
    match &command {
        Command::InitConfig => return init_config(),
        Command::Graph { output } => return print_graph(output.as_deref()),
        _ => {}
    }

    // Merge config with CLI args (CLI takes precedence)
    let mut cfg = Config::load();
    if args.provider.is_some() {
        cfg.provider = args.provider;
    }
    if args.model.is_some() {
        cfg.model = args.model;
    }

    match command {
        Command::Ingest { dir } => run_ingest(&cfg, &dir).await,
        Command::Serve { bind } => {
            let service = Arc::new(build_service(&cfg)?);
            let bind = bind.unwrap_or_else(|| cfg.bind().to_string());
            server::serve(&bind, service).await?;
            Ok(())
        }
        Command::Ask {
            message,
            conversation,
            json,
        } => run_ask(&build_service(&cfg)?, &conversation, &message, json).await,
        Command::Chat { conversation } => {
            let conversation =
                conversation.unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4().simple()));
            run_interactive(&build_service(&cfg)?, &conversation).await
        }
        Command::InitConfig | Command::Graph { .. } => Ok(()),
    }
}

fn init_config() -> anyhow::Result<()> {
    let path = Config::init().context("Error creating config")?;
    println!("Config file created at: {}", path.display());

    let catalog_path = Config::config_dir().join("catalog.toml");
    if !catalog_path.exists() {
        std::fs::write(&catalog_path, catalog::example_catalog())?;
        println!("Example catalog written to: {}", catalog_path.display());
    }
    println!("\nExample config:\n{}", config::example_config());
    Ok(())
}

fn print_graph(output: Option<&std::path::Path>) -> anyhow::Result<()> {
    let mermaid = clubsdr_agent::graph::mermaid();
    match output {
        Some(path) => {
            std::fs::write(path, &mermaid)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Graph written to: {}", path.display());
        }
        None => println!("{}", mermaid),
    }
    Ok(())
}

fn openai_provider(cfg: &Config) -> Option<Arc<OpenAIProvider>> {
    cfg.api_keys
        .openai
        .as_deref()
        .map(|key| Arc::new(OpenAIProvider::new(key)))
}

fn embedder(cfg: &Config) -> Option<Embedder> {
    openai_provider(cfg).map(|provider| {
        Embedder::new(
            provider,
            Provider::OpenAI.default_base_url(),
            cfg.embedding_model(),
        )
    })
}

fn chat_model(cfg: &Config) -> anyhow::Result<ProviderModel> {
    let provider = Provider::parse(cfg.provider_name());
    let mut model = Model::chat(provider, cfg.model_id());
    if let Some(ref base_url) = cfg.base_url {
        model.base_url = base_url.trim_end_matches('/').to_string();
    }
    if model.base_url.is_empty() {
        bail!(
            "Provider '{}' has no default base URL; set base_url in {}",
            cfg.provider_name(),
            Config::config_path().display()
        );
    }

    let api_key = match provider {
        Provider::OpenAI => cfg.api_keys.openai.clone(),
        other => other
            .api_key_env_var()
            .and_then(|var| std::env::var(var).ok()),
    };
    let api_key = match (api_key, provider.api_key_env_var()) {
        (Some(key), _) => key,
        (None, None) => String::new(),
        (None, Some(var)) => bail!(
            "No API key found for {}. Set {} or add it to {} (clubsdr init-config)",
            provider.name(),
            var,
            Config::config_path().display()
        ),
    };

    Ok(ProviderModel::new(
        Arc::new(OpenAIProvider::new(api_key)),
        model,
    ))
}

/// Wire the agent to Supabase when configured, otherwise to local stand-ins
fn build_service(cfg: &Config) -> anyhow::Result<TurnService> {
    let model = chat_model(cfg)?;
    let catalog = Arc::new(catalog::load_catalog(cfg.catalog_file.as_deref())?);

    let supabase = cfg
        .supabase_credentials()
        .map(|(url, key)| Arc::new(SupabaseClient::new(url, key)));

    let retriever: Arc<dyn Retriever> = match (&supabase, embedder(cfg)) {
        (Some(supabase), Some(embedder)) => Arc::new(SupabaseRetriever::new(
            supabase.clone(),
            embedder,
            cfg.supabase.match_threshold,
            cfg.supabase.match_count,
        )),
        _ => {
            let local = match cfg.knowledge_dir {
                Some(ref dir) => ingest::LocalRetriever::from_dir(dir, cfg.supabase.match_count)?,
                None => ingest::LocalRetriever::default(),
            };
            if local.is_empty() {
                tracing::warn!("No knowledge base configured; knowledge search will find nothing");
            } else {
                tracing::info!(chunks = local.len(), "Using local keyword search for knowledge");
            }
            Arc::new(local)
        }
    };

    let lead_store: Arc<dyn LeadStore> = match supabase {
        Some(supabase) => Arc::new(SupabaseLeadStore::new(supabase)),
        None => {
            tracing::warn!("Supabase not configured; leads are kept in memory only");
            Arc::new(InMemoryLeadStore::new())
        }
    };

    let agent = Agent::with_search(
        cfg.agent.clone(),
        Arc::new(model),
        retriever,
        catalog,
        lead_store,
    );
    let states = Arc::new(session::FileStateStore::new(cfg.state_dir()));
    Ok(TurnService::new(Arc::new(agent), states).with_timeout(cfg.turn_timeout()))
}

async fn run_ingest(cfg: &Config, dir: &std::path::Path) -> anyhow::Result<()> {
    let Some((url, key)) = cfg.supabase_credentials() else {
        bail!("Ingestion needs SUPABASE_URL and SUPABASE_KEY");
    };
    let Some(embedder) = embedder(cfg) else {
        bail!("Ingestion needs OPENAI_API_KEY for embeddings");
    };

    let supabase = SupabaseClient::new(url, key);
    let rows = ingest::ingest_dir(dir, &supabase, &embedder, cfg.source_url()).await?;
    println!("Ingested {} chunks from {}", rows, dir.display());
    Ok(())
}

async fn run_ask(
    service: &TurnService,
    conversation: &str,
    message: &str,
    json: bool,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let reply = service
        .submit_turn_with_cancel(TurnRequest::new(conversation, message), cancel)
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        println!("{}", reply.reply);
    }
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::ToolExecutionStart {
            tool_name,
            arguments,
            ..
        } => {
            let query = arguments
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or_default();
            eprintln!("[{}: {}]", tool_name, query);
        }
        AgentEvent::QueryRewritten { query } => eprintln!("[Retrying search: {}]", query),
        AgentEvent::Compacted { removed, retained } => {
            eprintln!("[Compacted: {} messages summarised, {} kept]", removed, retained)
        }
        AgentEvent::LeadUpdated {
            name,
            plan,
            intent_is_sale,
            persisted: true,
        } => eprintln!(
            "[Lead saved: name={} plan={} intent={}]",
            name.as_deref().unwrap_or("-"),
            plan.as_deref().unwrap_or("-"),
            intent_is_sale
        ),
        AgentEvent::Error { message } => eprintln!("Error: {}", message),
        _ => {}
    }
}

async fn run_interactive(service: &TurnService, conversation: &str) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let agent_name = service.agent().config().persona.agent_name.clone();
    let mut receiver = service.agent().subscribe();
    let handle = tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            print_event(&event);
        }
    });

    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("clubsdr conversation: {}", conversation);
        eprintln!("Type /lead to see captured lead data, /exit to quit.");
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/exit" | "/quit" => break,
            "/lead" => {
                match service.load_state(conversation).await? {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state.lead)?),
                    None => println!("No lead data yet."),
                }
                continue;
            }
            _ => {}
        }

        match service
            .submit_turn(TurnRequest::new(conversation, input))
            .await
        {
            Ok(reply) => println!("{}: {}\n", agent_name, reply.reply),
            Err(e) => eprintln!("Error: {}\n", e),
        }
    }

    handle.abort();
    Ok(())
}
