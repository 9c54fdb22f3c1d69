pub mod azure;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod integrations;
pub mod router;
pub mod traits;
pub mod transformer;
pub mod transport;
pub mod wire;
pub mod worker;

pub use azure::{AccessToken, AuthError, AuthType, AzureAadCredential, AzureAadCredentialConfig, AzureAadWebserver};
pub use config::DaemonConfig;
pub use error::{AsyncMessageError, DaemonError};
pub use integrations::{HeaderCodec, MqIntegration, ServiceBusIntegration};
pub use router::RouterMetrics;
pub use traits::Integration;
pub use transformer::{Selector, Transformer, TransformerContentType, TransformerError};
pub use transport::Transport;
pub use wire::{Context, Request, Response};
