//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the repository, the
//! prompt and session builders, and the in-process MCP client used to call
//! the tutor tools.

use crate::config::Config;
use anyhow::{Context, Result};
use rmcp::{
    ServiceExt,
    service::{RoleClient, RunningService},
};
use std::sync::Arc;
use tracing::{error, info};
use tutor_core::{
    prompt::{PromptAssembler, PromptTemplates},
    repository::{RepositoryOptions, TutorRepository},
    retrieval::Retriever,
    session::SessionFactory,
    store::DocumentStore,
    tools::TutorService,
    writer::BackgroundWriter,
};

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
pub struct AppState {
    pub repository: TutorRepository,
    pub assembler: PromptAssembler,
    pub sessions: SessionFactory,
    pub tools: RunningService<RoleClient, ()>,
    pub config: Arc<Config>,
}

impl AppState {
    pub async fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        templates: PromptTemplates,
        writer: Option<BackgroundWriter>,
        retriever: Option<Arc<Retriever>>,
    ) -> Result<Self> {
        let repository = TutorRepository::new(
            store,
            RepositoryOptions {
                reset_level_on_rename: config.reset_level_on_rename,
                ..Default::default()
            },
        );

        let service = TutorService::new(repository.clone(), writer, retriever);
        let sessions = SessionFactory::new(
            config.live_model.clone(),
            config.voice_name.clone(),
            service.declarations(),
        );
        let tools = serve_in_process(service).await?;
        info!(
            tools = sessions.declarations().len(),
            "Tool service connected"
        );

        Ok(Self {
            assembler: PromptAssembler::new(repository.clone(), templates),
            repository,
            sessions,
            tools,
            config: Arc::new(config),
        })
    }
}

/// Runs the tool server on one end of an in-memory duplex pipe and returns a
/// client connected to the other end.
async fn serve_in_process(service: TutorService) -> Result<RunningService<RoleClient, ()>> {
    let (server_transport, client_transport) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        match service.serve(server_transport).await {
            Ok(running) => {
                let _ = running.waiting().await;
            }
            Err(e) => error!(error = ?e, "Tool service failed to start"),
        }
    });

    ().serve(client_transport)
        .await
        .context("Failed to connect to the tool service")
}
