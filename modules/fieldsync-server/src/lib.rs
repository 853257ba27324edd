pub mod database;
pub mod image_events;
pub mod leader;
pub mod mover_service;
pub mod shutdown;
pub mod telemetry;

pub use mover_service::{build_scheduler, serve, MoverArgs};
