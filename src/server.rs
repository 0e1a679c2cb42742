use crate::{config::ServerConfig, routes::api_routes, session::Session, telemetry::Metrics};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState {
    pub session: Arc<Session>,
    pub metrics: Arc<Metrics>,
    #[cfg(feature = "opencv")]
    pub jpeg_quality: i32,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(HttpMetricsLayerBuilder::new().build())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let addr = config.get_address();
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            router: router(state),
            listener,
        })
    }

    pub async fn run(
        self,
        mut shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting control server on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            tracing::info!("Control server stopped");
            Ok::<(), anyhow::Error>(())
        });

        Ok(server_handle)
    }
}
