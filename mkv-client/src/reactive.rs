//! # Reactive Commands
//!
//! Purpose: Describe commands as cold, composable publishers that emit at most
//! one value and only touch the network once subscribed.
//!
//! ## Design Principles
//! 1. **Cold by Construction**: A `Mono` is a factory; nothing is dispatched
//!    until `subscribe()` or `single()`, and every subscription re-issues the
//!    command.
//! 2. **Zero or One**: Absent values complete without emitting.
//! 3. **Composition over Blocking**: `map`, `do_on_next`, `then` and `flat_map`
//!    chain work without ever joining on a result.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};

use mkv_common::{MkvResult, TtlStatus};

use crate::command::{self, Request};
use crate::connection::Connection;

type Source<T> = Arc<dyn Fn() -> BoxFuture<'static, MkvResult<Option<T>>> + Send + Sync>;

/// Lazy publisher of zero or one value.
pub struct Mono<T> {
    source: Source<T>,
}

impl<T> Clone for Mono<T> {
    fn clone(&self) -> Self {
        Mono {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T> fmt::Debug for Mono<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mono")
    }
}

impl<T: Send + 'static> Mono<T> {
    /// Builds a publisher that runs `factory` on every subscription.
    pub fn from_factory<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MkvResult<Option<T>>> + Send + 'static,
    {
        Mono {
            source: Arc::new(move || factory().boxed()),
        }
    }

    /// Emits `value` to every subscriber.
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_factory(move || future::ready(Ok(Some(value.clone()))))
    }

    /// Completes without emitting.
    pub fn empty() -> Self {
        Self::from_factory(|| future::ready(Ok(None)))
    }

    /// Starts the work and returns a stream with zero or one item, or a
    /// single error.
    pub fn subscribe(&self) -> BoxStream<'static, MkvResult<T>> {
        stream::once((self.source)())
            .filter_map(|outcome| future::ready(outcome.transpose()))
            .boxed()
    }

    /// Starts the work and resolves to the emitted value, if any.
    pub fn single(&self) -> BoxFuture<'static, MkvResult<Option<T>>> {
        (self.source)()
    }

    /// Transforms the emitted value.
    pub fn map<U, F>(self, f: F) -> Mono<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let source = self.source;
        let f = Arc::new(f);
        Mono::from_factory(move || {
            let upstream = source();
            let f = Arc::clone(&f);
            async move { Ok(upstream.await?.map(|value| f(value))) }
        })
    }

    /// Runs a side effect on the emitted value and passes it through.
    pub fn do_on_next<F>(self, f: F) -> Mono<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let source = self.source;
        let f = Arc::new(f);
        Mono::from_factory(move || {
            let upstream = source();
            let f = Arc::clone(&f);
            async move {
                let value = upstream.await?;
                if let Some(value) = &value {
                    f(value);
                }
                Ok(value)
            }
        })
    }

    /// Waits for this publisher to complete, discards its value and continues
    /// with `next`. Errors short-circuit.
    pub fn then<U: Send + 'static>(self, next: Mono<U>) -> Mono<U> {
        let source = self.source;
        Mono::from_factory(move || {
            let upstream = source();
            let next = next.clone();
            async move {
                upstream.await?;
                next.single().await
            }
        })
    }

    /// Chains a dependent publisher built from the emitted value.
    ///
    /// Does not run `f` when nothing was emitted.
    pub fn flat_map<U, F>(self, f: F) -> Mono<U>
    where
        U: Send + 'static,
        F: Fn(T) -> MkvResult<Mono<U>> + Send + Sync + 'static,
    {
        let source = self.source;
        let f = Arc::new(f);
        Mono::from_factory(move || {
            let upstream = source();
            let f = Arc::clone(&f);
            async move {
                match upstream.await? {
                    Some(value) => f(value)?.single().await,
                    None => Ok(None),
                }
            }
        })
    }
}

/// Reactive view over a shared [`Connection`].
#[derive(Debug, Clone)]
pub struct ReactiveCommands {
    conn: Connection,
}

impl ReactiveCommands {
    pub(crate) fn new(conn: Connection) -> Self {
        ReactiveCommands { conn }
    }

    fn defer<T: Send + 'static>(&self, request: Request<T>) -> Mono<T> {
        self.defer_optional(request, Some)
    }

    fn defer_optional<T, U>(&self, request: Request<T>, present: fn(T) -> Option<U>) -> Mono<U>
    where
        T: Send + 'static,
        U: Send + 'static,
    {
        let conn = self.conn.clone();
        let request = Arc::new(request);
        Mono::from_factory(move || {
            let conn = conn.clone();
            let request = Arc::clone(&request);
            async move { conn.execute(&request).await.map(present) }
        })
    }

    pub fn set(&self, key: &str, value: &str) -> MkvResult<Mono<String>> {
        Ok(self.defer(command::set(key, value)?))
    }

    /// Emits nothing when the key is missing.
    pub fn get(&self, key: &str) -> MkvResult<Mono<String>> {
        Ok(self.defer_optional(command::get(key)?, |value| value))
    }

    pub fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> MkvResult<Mono<String>> {
        Ok(self.defer(command::set_with_expiry(key, value, ttl_secs)?))
    }

    pub fn ttl(&self, key: &str) -> MkvResult<Mono<TtlStatus>> {
        Ok(self.defer(command::ttl(key)?))
    }

    pub fn set_hash_fields(&self, key: &str, fields: &HashMap<String, String>) -> MkvResult<Mono<i64>> {
        Ok(self.defer(command::set_hash_fields(key, fields)?))
    }

    pub fn get_hash_fields(&self, key: &str) -> MkvResult<Mono<HashMap<String, String>>> {
        Ok(self.defer(command::get_hash_fields(key)?))
    }

    pub fn exists(&self, key: &str) -> MkvResult<Mono<bool>> {
        Ok(self.defer(command::exists(key)?))
    }

    pub fn ping(&self) -> Mono<String> {
        self.defer(command::ping())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mkv_common::MkvError;

    fn counting(counter: Arc<AtomicUsize>, value: Option<i64>) -> Mono<i64> {
        Mono::from_factory(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok(value))
        })
    }

    #[test]
    fn nothing_runs_until_subscribed() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mono = counting(Arc::clone(&runs), Some(1)).map(|n| n * 10);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let items: Vec<_> = futures::executor::block_on(mono.subscribe().collect());
        assert_eq!(items.len(), 1);
        assert_eq!(*items[0].as_ref().unwrap(), 10);

        futures::executor::block_on(mono.single()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_completes_without_items() {
        let items: Vec<MkvResult<i64>> = futures::executor::block_on(Mono::empty().subscribe().collect());
        assert!(items.is_empty());
    }

    #[test]
    fn errors_are_a_single_signal() {
        let mono: Mono<i64> = Mono::from_factory(|| future::ready(Err(MkvError::ConnectionClosed)));
        let items: Vec<_> = futures::executor::block_on(mono.subscribe().collect());
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_connection_closed());
    }

    #[test]
    fn flat_map_skips_on_empty() {
        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&called);
        let mono = Mono::<i64>::empty().flat_map(move |n| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Mono::just(n + 1))
        });
        assert_eq!(futures::executor::block_on(mono.single()).unwrap(), None);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn then_runs_in_sequence() {
        let first = Arc::new(AtomicUsize::new(0));
        let mono = counting(Arc::clone(&first), Some(1))
            .do_on_next(|n| assert_eq!(*n, 1))
            .then(Mono::just("done".to_string()));
        assert_eq!(
            futures::executor::block_on(mono.single()).unwrap(),
            Some("done".to_string())
        );
        assert_eq!(first.load(Ordering::SeqCst), 1);
    }
}
