//! HTTP surface — webhook intake, WhatsApp callbacks, and the landing
//! page API.

pub mod routes;

pub use routes::{ApiState, api_routes};
