//! Session management for the prediction service.

mod interactive;
mod manager;
mod store;
mod token;


pub use manager::{AuthStatus, CredentialManager};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use token::{mask, Identity, Token, TokenResponse};
