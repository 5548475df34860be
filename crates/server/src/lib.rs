//! Proxy server: the OpenAI-compatible HTTP surface, episode orchestration
//! and graceful shutdown.

pub mod chat;
pub mod handlers;
pub mod tail;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tinymem_audit::ShadowAuditor;
use tinymem_config::AppConfig;
use tinymem_etv::FsReader;
use tinymem_hydration::{Budget, EmbedFn, HydrationEngine};
use tinymem_llm::UpstreamClient;
use tinymem_promotion::PromotionRuntime;
use tinymem_resolver::{EntityResolver, StoreStateLookup, patterns::PatternTable};
use tinymem_store::Store;

/// Seconds the shutdown sequence waits for the audit queue to drain.
const SHUTDOWN_DRAIN_SECS: u64 = 10;

pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub upstream: UpstreamClient,
    pub promotion: PromotionRuntime,
    pub hydration: HydrationEngine,
    pub auditor: ShadowAuditor,
    pub reader: FsReader,
    pub started_at: Instant,
    /// Last fully-assembled upstream payload, kept only in debug mode.
    pub last_prompt: Mutex<Option<serde_json::Value>>,
}

impl AppState {
    /// Wire every component to the shared store. Returns the state and the
    /// auditor worker handle (joined during shutdown).
    pub fn build(config: AppConfig) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let store = Store::open(&config.database.database_path).with_context(|| {
            format!("opening database {}", config.database.database_path)
        })?;

        let upstream = UpstreamClient::new(
            &config.llm.llm_endpoint,
            &config.llm.llm_api_key,
            &config.llm.llm_model,
        )?;

        let resolver = Arc::new(
            EntityResolver::new(
                Box::new(StoreStateLookup::new(store.clone())),
                PatternTable::load_default()?,
            )
            .with_store(store.clone()),
        );
        let promotion = PromotionRuntime::new(
            store.clone(),
            resolver,
            config.tombstones.episodes_retained,
        );

        let embed = config
            .hydration
            .enable_semantic_ranking
            .then(|| make_embed_fn(&config))
            .flatten();
        let hydration = HydrationEngine::new(store.clone(), config.hydration.clone(), embed);

        let (auditor, audit_handle) = ShadowAuditor::spawn(
            store.clone(),
            upstream.clone(),
            Duration::from_secs(config.audit.timeout_secs),
            config.audit.queue_depth,
        );

        let state = Arc::new(Self {
            store,
            upstream,
            promotion,
            hydration,
            auditor,
            reader: FsReader::new(),
            started_at: Instant::now(),
            last_prompt: Mutex::new(None),
            config,
        });
        Ok((state, audit_handle))
    }

    pub fn hydration_budget(&self) -> Budget {
        Budget {
            max_tokens: self.config.hydration.max_tokens,
            max_entities: self.config.hydration.max_entities,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/user/code", post(handlers::user_code))
        .route("/health", get(handlers::health))
        .route("/doctor", get(handlers::doctor))
        .route("/state", get(handlers::state_view))
        .route("/recent", get(handlers::recent));

    if state.config.debug_endpoints_enabled() {
        router = router
            .route("/debug/last-prompt", get(handlers::debug_last_prompt))
            .route("/debug/reset", post(handlers::debug_reset));
    }

    router.with_state(state)
}

/// Serve until `shutdown` resolves, then drain the audit queue under a
/// bounded deadline and close the store.
pub async fn run(config: AppConfig, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let listen_address = config.proxy.listen_address.clone();
    let (state, audit_handle) = AppState::build(config)?;
    let auditor = state.auditor.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("binding {listen_address}"))?;
    info!(%listen_address, "tinymem proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serving http")?;

    info!("draining shadow-audit queue");
    auditor.shutdown().await;
    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), audit_handle).await {
        Ok(Ok(())) => info!("audit queue drained"),
        Ok(Err(err)) => error!(error = %err, "audit worker panicked"),
        Err(_) => warn!(
            deadline_secs = SHUTDOWN_DRAIN_SECS,
            "audit queue did not drain before the deadline"
        ),
    }
    Ok(())
}

/// Embedding callback against an OpenAI-compatible `/embeddings` endpoint.
/// Provider failures degrade to `None`; hydration then skips semantic
/// expansion rather than failing the request.
fn make_embed_fn(config: &AppConfig) -> Option<EmbedFn> {
    let endpoint = config.hydration.embedding_endpoint.trim_end_matches('/');
    if endpoint.is_empty() {
        return None;
    }
    let url = format!("{endpoint}/embeddings");
    let model = config.hydration.embedding_model.clone();
    let api_key = config.hydration.embedding_api_key.clone();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .ok()?;

    Some(Arc::new(move |text: String| {
        let client = client.clone();
        let url = url.clone();
        let model = model.clone();
        let api_key = api_key.clone();
        Box::pin(async move {
            let body = serde_json::json!({ "model": model, "input": text });
            let mut request = client.post(&url).json(&body);
            if !api_key.is_empty() {
                request = request.bearer_auth(&api_key);
            }
            let response = request.send().await.ok()?;
            let json: serde_json::Value = response.json().await.ok()?;
            let embedding = json["data"][0]["embedding"]
                .as_array()?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Vec<f32>>();
            if embedding.is_empty() { None } else { Some(embedding) }
        })
    }))
}
