//! Reliability layer between the coaching marketplace and its external
//! providers: webhook ingestion, OAuth token lifecycle, and resilient
//! outbound calls for Cal.com, Calendly, Stripe and Zoom.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod http_server;
pub mod oauth;
pub mod outbound;
pub mod providers;
pub mod retry;
pub mod store;
pub mod types;
pub mod webhook;

pub use config::Config;
pub use error::{IntegrationError, Result};
pub use http_server::{router, AppState};
