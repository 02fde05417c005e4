//! Main Entrypoint for the Scope API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the agent and assessor prompts.
//! 3. Initializing the shared collaborators (review hand-off and sidecar assessor).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use scope_api::{config::Config, router::create_router, state::AppState};
use scope_core::{
    collaborator::{HttpReviewCollaborator, LoopbackReviewCollaborator, ReviewCollaborator},
    sidecar::{AssessmentInference, OpenAICompatibleAssessor},
};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Could not read prompts from {}", prompts_path.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            prompts.insert(prompt_key, fs::read_to_string(&path)?);
        }
    }
    Ok(prompts)
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

    // --- 3. Load Prompts ---
    let mut prompts = load_prompts(&config.prompts_path)?;
    let instructions = Arc::new(
        prompts
            .remove("system_prompt")
            .context("system_prompt.md not found in prompts directory")?,
    );

    // --- 4. Initialize Shared Services ---
    let collaborator: Arc<dyn ReviewCollaborator> = match &config.review_endpoint {
        Some(endpoint) => {
            info!(%endpoint, "Finalized sessions will be posted to the review endpoint.");
            Arc::new(HttpReviewCollaborator::new(endpoint.clone()))
        }
        None => {
            warn!("REVIEW_ENDPOINT not set; finalized sessions are acknowledged locally.");
            Arc::new(LoopbackReviewCollaborator)
        }
    };

    let assessor: Option<Arc<dyn AssessmentInference>> = match &config.sidecar {
        Some(sidecar) => {
            let system_prompt = prompts
                .remove("sidecar_prompt")
                .context("sidecar_prompt.md not found in prompts directory")?;
            info!(model = %sidecar.model, base_url = %sidecar.base_url, "Sidecar assessor enabled.");
            let openai_config = OpenAIConfig::new()
                .with_api_key(&sidecar.api_key)
                .with_api_base(&sidecar.base_url);
            Some(Arc::new(OpenAICompatibleAssessor::new(
                openai_config,
                sidecar.model.clone(),
                system_prompt,
            )))
        }
        None => {
            info!("SIDECAR_API_KEY not set; assessment relies on the voice agent alone.");
            None
        }
    };

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        instructions,
        collaborator,
        assessor,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.realtime_model,
        voice = %config.realtime_voice,
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

    info!("Server has shut down.");
    Ok(())
}
