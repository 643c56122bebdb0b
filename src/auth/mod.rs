//! Token acquisition and auth bridging.
//!
//! Three cooperating services: RFC 8693 exchange against the trusted IdP,
//! OAuth2 client-credentials for service-to-service auth, and OIDC discovery
//! plus exchange against external identity providers. All cache their tokens
//! keyed on subject-token hash + target audience.

pub mod claims;
pub mod client_credentials;
pub mod exchange;
pub mod external_idp;
pub mod oidc;
pub mod token_cache;

pub use claims::UserContext;
pub use client_credentials::ClientCredentialsService;
pub use exchange::TokenExchanger;
pub use external_idp::ExternalIdpProvider;
pub use oidc::{DiscoveryDocument, OidcDiscoveryCache};
pub use token_cache::{RedisTokenCache, SharedTokenCache, TokenCacheEntry};
