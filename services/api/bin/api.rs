//! Main Entrypoint for the Tutor API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Resolving credentials and connecting the document store.
//! 3. Loading the prompt templates and optional retrieval index.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tutor_api::{
    config::{Config, CredentialSource, StoreBackend},
    router::create_router,
    state::AppState,
};
use tutor_core::{
    credentials::{
        MetadataServerTokens, ServiceAccountKey, ServiceAccountTokens, StaticToken, TokenProvider,
    },
    prompt::PromptTemplates,
    retrieval::{Retriever, VertexEmbedder},
    store::{DocumentStore, FirestoreStore, InMemoryStore},
    writer::BackgroundWriter,
};

/// Capacity of the background write queue.
const WRITE_QUEUE_CAPACITY: usize = 256;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts directory {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

fn token_provider(
    config: &Config,
    http: &reqwest::Client,
) -> anyhow::Result<Arc<dyn TokenProvider>> {
    Ok(match &config.credentials {
        CredentialSource::MetadataServer => {
            info!("Using metadata server credentials.");
            Arc::new(MetadataServerTokens::new(http.clone()))
        }
        CredentialSource::ServiceAccountFile(path) => {
            info!(path = %path.display(), "Using service account credentials.");
            let key = ServiceAccountKey::from_file(path)?;
            Arc::new(ServiceAccountTokens::new(http.clone(), key)?)
        }
        // The emulator accepts this fixed token.
        CredentialSource::Unauthenticated => Arc::new(StaticToken("owner".to_string())),
    })
}

fn document_store(
    config: &Config,
    http: &reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
) -> Arc<dyn DocumentStore> {
    match (&config.store_backend, &config.firestore_emulator_host) {
        (StoreBackend::Memory, _) => {
            warn!("Using the in-memory store; data is lost on shutdown.");
            Arc::new(InMemoryStore::new())
        }
        (StoreBackend::Firestore, Some(host)) => {
            info!(%host, "Using the Firestore emulator.");
            Arc::new(FirestoreStore::with_endpoint(
                http.clone(),
                tokens,
                &format!("http://{}", host),
                &config.project_id,
                &config.firestore_database,
            ))
        }
        (StoreBackend::Firestore, None) => Arc::new(FirestoreStore::new(
            http.clone(),
            tokens,
            &config.project_id,
            &config.firestore_database,
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Credentials and Document Store ---
    let http = reqwest::Client::new();
    let tokens = token_provider(&config, &http).context("Failed to load credentials")?;
    let store = document_store(&config, &http, tokens.clone());
    info!(backend = store.name(), project = %config.project_id, "Document store ready.");

    // --- 4. Prompts, Writer and Retrieval ---
    let prompts = load_prompts(&config.prompts_path)?;
    let templates = PromptTemplates::from_map(&prompts)?;

    let writer = if config.background_writes {
        let (writer, _worker) = BackgroundWriter::spawn(WRITE_QUEUE_CAPACITY);
        info!("Background writes enabled.");
        Some(writer)
    } else {
        None
    };

    let retriever = if config.retrieval_urls.is_empty() {
        None
    } else {
        let embedder = VertexEmbedder::new(
            http.clone(),
            tokens.clone(),
            &config.project_id,
            &config.region,
            &config.embedding_model,
        );
        let retriever = Retriever::new(Arc::new(embedder));
        retriever
            .ingest_urls(&http, &config.retrieval_urls)
            .await
            .context("Failed to build the retrieval index")?;
        Some(Arc::new(retriever))
    };

    let app_state = Arc::new(
        AppState::new(config.clone(), store, templates, writer.clone(), retriever).await?,
    );

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.live_model,
        voice = %config.voice_name,
        region = %config.region,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(writer) = writer {
        info!("Waiting for queued writes...");
        writer.flush().await?;
    }
    info!("Server has shut down.");
    Ok(())
}
