//! Tool-provider runtime: per-(user, service) worker connections, the
//! credentials that launch them, and a bounded agent loop that routes model
//! tool calls to the right worker.

pub mod cli;
pub mod config;
pub mod core;
pub mod logging;
pub mod platform;

pub use crate::config::Config;
pub use crate::core::brain::{AgentError, AgentLoop, AgentOutcome, AgentSettings, NoServicesPolicy, SessionSeed};
pub use crate::core::credentials::{AuthPayload, Credential, CredentialError, CredentialStore, PayloadUpdate, SecretCipher};
pub use crate::core::mcp::{ConnectionState, Connector, ProviderError, StdioConnector, ToolDescriptor, ToolProvider};
pub use crate::core::pool::{ConnectionPool, PoolError, PoolSettings, PoolStats};
pub use crate::core::service::{ServiceDefinition, ServiceRegistry, ServiceTag};
