//! OAuth code flow and token lifecycle for the calendar and video providers.

pub mod manager;
pub mod state;

pub use manager::TokenManager;
pub use state::{OAuthState, PkceChallenge, StateSigner};
