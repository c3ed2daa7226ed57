//! # Target Resolution
//!
//! The facade never decides where the store lives. A composition root picks a
//! `TargetResolver` implementation and hands the resolved `ConnectionTarget`
//! to `Connection::connect`.
//!
//! Implementations:
//! - `StaticResolver` (here): a fixed address, e.g. a locally running store.
//! - `EphemeralResolver` (`mkv-server`): provisions a throwaway instance and
//!   additionally exposes `teardown()`.

use crate::error::MkvResult;
use crate::types::{ConnectionTarget, DEFAULT_PORT};

/// Supplies the address of the store.
///
/// `resolve` must not block indefinitely and fails with
/// `MkvError::UnavailableTarget` when no address can be produced.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self) -> MkvResult<ConnectionTarget>;
}

impl<R: TargetResolver + ?Sized> TargetResolver for &R {
    fn resolve(&self) -> MkvResult<ConnectionTarget> {
        (**self).resolve()
    }
}

impl<R: TargetResolver + ?Sized> TargetResolver for Box<R> {
    fn resolve(&self) -> MkvResult<ConnectionTarget> {
        (**self).resolve()
    }
}

/// Resolver returning a fixed, preconfigured target.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    target: ConnectionTarget,
}

impl StaticResolver {
    pub fn new(target: ConnectionTarget) -> Self {
        StaticResolver { target }
    }

    /// Parses `uri` once; `resolve` then always returns the same target.
    pub fn from_uri(uri: &str) -> MkvResult<Self> {
        Ok(StaticResolver {
            target: ConnectionTarget::parse(uri)?,
        })
    }

    /// Targets a store on `localhost:6379`.
    pub fn localhost() -> Self {
        StaticResolver {
            target: ConnectionTarget::localhost(DEFAULT_PORT),
        }
    }
}

impl TargetResolver for StaticResolver {
    fn resolve(&self) -> MkvResult<ConnectionTarget> {
        Ok(self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_is_stable() {
        let resolver = StaticResolver::from_uri("redis://10.0.0.5:7001").unwrap();
        let first = resolver.resolve().unwrap();
        let second = resolver.resolve().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.socket_addr(), "10.0.0.5:7001");
    }

    #[test]
    fn localhost_default() {
        let target = StaticResolver::localhost().resolve().unwrap();
        assert_eq!(target.to_string(), "redis://localhost:6379");
    }

    #[test]
    fn boxed_resolver_dispatches() {
        let resolver: Box<dyn TargetResolver> = Box::new(StaticResolver::localhost());
        assert_eq!(resolver.resolve().unwrap().port(), 6379);
    }
}
