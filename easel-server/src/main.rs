use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use easel_core::{get_available_models, get_image_generator, Config, GenerationRequest, ImageGenerator};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Serve a deterministic mock backend instead of a real model
    #[arg(long)]
    mock: bool,

    /// Override the configured image model ("flux" or "zimage")
    #[arg(long)]
    model: Option<String>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

/// Encodes the saved image file as a base64 PNG for inline transport.
async fn image_to_base64_png(path: &std::path::Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Serialize)]
struct GenerationResponse {
    image: String,
    #[serde(flatten)]
    result: easel_core::GenerationResult,
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<&'static str>,
}

// Application state containing the preloaded generator and its config.
struct AppState {
    generator: Box<dyn ImageGenerator>,
    config: Arc<Config>,
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> impl IntoResponse {
    match generate_image(req, &state).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            error!("image generation failed: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}")).into_response()
        }
    }
}

async fn generate_image(request: GenerationRequest, state: &AppState) -> Result<GenerationResponse> {
    let result = state.generator.generate(request).await?;
    let image = image_to_base64_png(&result.image_path).await?;
    Ok(GenerationResponse { image, result })
}

async fn list_models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ModelsResponse {
        models: get_available_models(&state.config),
    })
}

async fn model_info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.generator.get_model_info())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if args.cpu {
        config.system.cpu_only = true;
    }
    if let Some(model) = &args.model {
        config.model.image_model = model.clone();
    }
    let config = Arc::new(config);

    let generator = get_image_generator(config.clone(), args.mock)?;
    // Load eagerly so the first request does not pay the model download and
    // weight-mapping cost.
    generator.load_model().await?;
    info!(model = generator.id(), "model loaded");

    let shared_state = Arc::new(AppState { generator, config });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/models", get(list_models_handler))
        .route("/v1/models/info", get(model_info_handler))
        .with_state(shared_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
