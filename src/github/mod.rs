//! GitHub REST client used by [`crate::host::GitHubGateway`].

pub mod backoff;
pub mod http;
pub mod types;
