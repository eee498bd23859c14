//! Dev HTTP server: static roots, `/api` forwarding to the backend, the
//! components route and live-reload notifications.

pub mod proxy;

use axum::{
    extract::{Request, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{any, get},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::util::BoxCloneService;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::backend::Mode;
use crate::config::DevConfig;
use crate::supervisor::{BackendStatus, BackendSupervisor};
use crate::watch::ReloadEvent;

pub const STATUS_ROUTE: &str = "/__devserve/backend";
pub const RELOAD_ROUTE: &str = "/__devserve/reload";

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("HTTPS serving is not supported; terminate TLS in front of devserve or set serve.enable_https = false")]
    HttpsUnsupported,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// What to serve for one mode.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub port: u16,
    pub enable_https: bool,
    pub api_prefix: String,
    pub backend_port: u16,
    /// Tried in order; the first root that has the file wins.
    pub static_roots: Vec<PathBuf>,
    /// `(route, dir)`; development only.
    pub components: Option<(String, PathBuf)>,
}

impl ServeOptions {
    pub fn from_config(cfg: &DevConfig, mode: Mode) -> Self {
        let (static_roots, components) = match mode {
            Mode::Development => {
                let mut roots = vec![cfg.paths.serve.clone(), cfg.paths.frontend_src.clone()];
                roots.extend(cfg.paths.extra_serve.iter().cloned());
                let components = Some((
                    cfg.serve.components_route.clone(),
                    cfg.paths.components.clone(),
                ));
                (roots, components)
            }
            Mode::Production => (vec![cfg.paths.dist.clone()], None),
        };
        Self {
            port: cfg.serve.port,
            enable_https: cfg.serve.enable_https,
            api_prefix: cfg.serve.api_prefix.clone(),
            backend_port: cfg.backend_port(mode),
            static_roots,
            components,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<BackendSupervisor>,
    pub reload: broadcast::Sender<ReloadEvent>,
    pub upstream: Arc<proxy::Upstream>,
}

impl AppState {
    pub fn new(
        supervisor: Arc<BackendSupervisor>,
        reload: broadcast::Sender<ReloadEvent>,
        backend_port: u16,
    ) -> Self {
        Self {
            supervisor,
            reload,
            upstream: Arc::new(proxy::Upstream::localhost(backend_port)),
        }
    }
}

pub fn router(opts: &ServeOptions, state: AppState) -> Router {
    let prefix = opts.api_prefix.trim_end_matches('/');
    let mut app = Router::new()
        .route(STATUS_ROUTE, get(backend_status))
        .route(RELOAD_ROUTE, get(reload_events))
        .route(prefix, any(proxy::forward))
        .route(&format!("{}/*rest", prefix), any(proxy::forward));

    if let Some((route, dir)) = &opts.components {
        app = app.nest_service(route, ServeDir::new(dir));
    }

    app.fallback_service(static_service(&opts.static_roots))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type StaticService = BoxCloneService<Request, Response, Infallible>;

/// Chain the roots so a miss in one falls through to the next.
fn static_service(roots: &[PathBuf]) -> StaticService {
    let mut next: Option<StaticService> = None;
    for root in roots.iter().rev() {
        let dir = ServeDir::new(root);
        next = Some(match next {
            Some(fallback) => BoxCloneService::new(ServiceExt::<Request>::map_response(
                dir.fallback(fallback),
                IntoResponse::into_response,
            )),
            None => BoxCloneService::new(ServiceExt::<Request>::map_response(
                dir,
                IntoResponse::into_response,
            )),
        });
    }
    next.unwrap_or_else(|| {
        BoxCloneService::new(tower::service_fn(|_req: Request| async {
            Ok::<_, Infallible>(axum::http::StatusCode::NOT_FOUND.into_response())
        }))
    })
}

async fn backend_status(State(state): State<AppState>) -> Json<BackendStatus> {
    Json(state.supervisor.status())
}

async fn reload_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.reload.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let event = Event::default()
                        .event("reload")
                        .json_data(&ev)
                        .unwrap_or_else(|_| Event::default().event("reload"));
                    return Some((Ok(event), rx));
                }
                // 밀린 이벤트는 건너뛰고 다음 것만 보내면 충분
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Serve until `shutdown` resolves.
pub async fn run<F>(opts: ServeOptions, state: AppState, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    if opts.enable_https {
        return Err(ServeError::HttpsUnsupported);
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], opts.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;

    let app = router(&opts, state);
    tracing::info!(
        "Serving {:?} on http://{} ({} -> {})",
        opts.static_roots,
        addr,
        opts.api_prefix,
        opts.backend_port
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
