use crate::camera::{CameraError, FrameSource, StillImageSource};
use crate::config::{CameraConfig, Config, FrameSourceKind};
use crate::detection_client::DetectionClient;
use crate::server::{HttpServer, SharedState};
use crate::session::Session;
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

#[cfg(feature = "opencv")]
use crate::camera::Camera;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);

    #[cfg(feature = "opencv")]
    let source: Arc<dyn FrameSource> = match config.camera.source {
        FrameSourceKind::Camera => Arc::new(Camera::new(&config.camera).await?),
        FrameSourceKind::Image => still_image(&config.camera)?,
    };
    #[cfg(not(feature = "opencv"))]
    let source: Arc<dyn FrameSource> = match config.camera.source {
        FrameSourceKind::Camera => {
            tracing::error!("Camera capture needs the `opencv` feature");
            return Err(Box::new(CameraError::Unsupported("camera")));
        }
        FrameSourceKind::Image => still_image(&config.camera)?,
    };

    let client = match DetectionClient::new(&config.backend) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("Failed to initialize detection client: {:?}", e);
            return Err(Box::new(e));
        }
    };
    tracing::info!("Detection backend at {}", client.base_url());

    let session = Arc::new(
        Session::new(source, client, &config.readiness, &config.detection)
            .with_metrics(metrics.clone()),
    );

    let state = SharedState {
        session: session.clone(),
        metrics,
        #[cfg(feature = "opencv")]
        jpeg_quality: config.camera.jpeg_quality as i32,
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    if config.session.autostart {
        session.start();
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    session.stop();
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

fn still_image(config: &CameraConfig) -> Result<Arc<dyn FrameSource>, CameraError> {
    let path = config
        .image_path
        .as_ref()
        .ok_or(CameraError::MissingImagePath)?;
    tracing::info!("Using still image {} as frame source", path.display());

    let source = StillImageSource::from_path(path, config.width, config.height, config.jpeg_quality)?;
    Ok(Arc::new(source))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
