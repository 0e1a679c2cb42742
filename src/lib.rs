pub mod bounding_box;
pub mod camera;
#[cfg(feature = "opencv")]
mod cv_utils;
pub mod detection_client;
pub mod detection_loop;
pub mod overlay;
pub mod readiness;
mod routes;
pub mod server;
pub mod session;
pub mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
