//! Consumer facade over the instance cache.
//!
//! [`ModelHost`] is what a server's request handlers talk to: it resolves a
//! model id through a [`Cataloger`](crate::catalog::Cataloger), layers the
//! request's overrides on top, derives the [`CacheKey`](crate::CacheKey) and
//! acquires a [`Lease`](crate::Lease). It also owns the session registry that
//! maps session ids to their scoped cache keys.

mod builder;
mod host;

pub use builder::HostBuilder;
pub use host::ModelHost;
