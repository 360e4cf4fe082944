//! HTTP API handlers for epinet-agg

pub mod epinets;
pub mod health;
pub mod sse;

pub use epinets::epinet_routes;
pub use health::health_routes;
pub use sse::load_event_stream;
