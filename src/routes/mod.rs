mod controls;
mod health;
mod metrics;
#[cfg(feature = "opencv")]
mod snapshot;
mod status;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    let router = Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/status", get(status::session_status))
        .route("/overlay", get(status::overlay))
        .route("/session/start", post(controls::start_session))
        .route("/session/stop", post(controls::stop_session))
        .route("/backend/retry", post(controls::retry_backend))
        .route("/backend/force-start", post(controls::force_start));

    #[cfg(feature = "opencv")]
    let router = router.route("/snapshot", get(snapshot::snapshot));

    router
}

#[cfg(test)]
mod tests {
    use crate::bounding_box::{BoundingBox, DetectionBatch, Prediction};
    use crate::camera::{CapturedFrame, StillImageSource};
    use crate::config::{DetectionConfig, ReadinessConfig};
    use crate::detection_client::{DetectionClientError, Detector};
    use crate::readiness::{HealthProbe, HealthStatus};
    use crate::server::{router, SharedState};
    use crate::session::Session;
    use crate::telemetry::Metrics;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use reqwest::StatusCode;
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use tokio::net::TcpListener;

    struct LoadingBackend;

    #[async_trait]
    impl HealthProbe for LoadingBackend {
        async fn check(&self) -> Result<HealthStatus, DetectionClientError> {
            Ok(HealthStatus {
                model_loaded: false,
                message: None,
            })
        }
    }

    #[async_trait]
    impl Detector for LoadingBackend {
        async fn detect(&self, _frame: &CapturedFrame) -> Result<DetectionBatch, DetectionClientError> {
            Ok(vec![Prediction {
                bbox: BoundingBox::new(10.0, 30.0, 40.0, 40.0),
                label: "cell phone".into(),
                confidence: 0.75,
            }])
        }
    }

    async fn serve() -> (String, Arc<Session>) {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, Rgb([0, 0, 0])));
        let source = StillImageSource::from_image(image, 64, 48, 80).unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let session = Arc::new(
            Session::new(
                Arc::new(source),
                Arc::new(LoadingBackend),
                &ReadinessConfig::default(),
                &DetectionConfig::default(),
            )
            .with_metrics(metrics.clone()),
        );

        let state = SharedState {
            session: session.clone(),
            metrics,
            #[cfg(feature = "opencv")]
            jpeg_quality: 80,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{}", addr), session)
    }

    async fn status(client: &reqwest::Client, base: &str) -> Value {
        client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_route() {
        let (base, _) = serve().await;
        let body: Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "Available");
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let (base, session) = serve().await;
        let client = reqwest::Client::new();

        let idle = status(&client, &base).await;
        assert_eq!(idle["readiness"]["state"], "connecting");
        assert_eq!(idle["detecting"], false);

        let started: Value = client
            .post(format!("{}/session/start", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(started["changed"], true);

        let response = client
            .post(format!("{}/backend/force-start", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Second force-start has nothing left to force.
        let response = client
            .post(format!("{}/backend/force-start", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        for _ in 0..200 {
            if session.status().detection.frames_processed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let running = status(&client, &base).await;
        assert_eq!(running["readiness"]["state"], "ready");
        assert_eq!(running["forced_start"], true);
        assert_eq!(running["detection"]["counters"]["device_count"], 1);

        let overlay: Value = client
            .get(format!("{}/overlay", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(overlay["width"], 64);
        assert_eq!(overlay["commands"][0]["op"], "clear");

        let stopped: Value = client
            .post(format!("{}/session/stop", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["changed"], true);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_metrics_route_exposes_control_requests() {
        let (base, _) = serve().await;
        let client = reqwest::Client::new();
        client.get(format!("{}/status", base)).send().await.unwrap();

        let body = client
            .get(format!("{}/metrics", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("control_requests"));
    }
}
