//! Azure Entra ID (AAD) token credential (§4.7).
//!
//! Grounded in `original_source/common/src/grizzly_common/azure/aad.py`.

mod aad;
mod webserver;

pub use aad::{AccessToken, AuthError, AuthMethod, AuthType, AzureAadCredential, AzureAadCredentialConfig};
pub use webserver::AzureAadWebserver;
