//! Narrowly-scoped inversion-of-control registry for use cases (§4.9).
//!
//! The original design talks about `Class<Input, Output, Error>`
//! instances resolved by class key with constructor injection. In Rust
//! the natural analogue is a boxed closure registered under a type-keyed
//! slot: `UseCase<In, Out, Err>` is a function value, and the registry
//! is just type-erased storage keyed by `TypeId`.

use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// A use case invocation is asynchronous: real use cases in this crate
/// (e.g. `VerifyThingAttachedToCertificate`) call through to the cloud
/// collaborator (§4.9). Retries are the caller's responsibility.
#[async_trait]
pub trait UseCase<In, Out, Err>: Send + Sync
where
    In: Send + 'static,
{
    async fn execute(&self, input: In) -> Result<Out, Err>;
}

#[async_trait]
impl<In, Out, Err, F, Fut> UseCase<In, Out, Err> for F
where
    In: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Out, Err>> + Send,
{
    async fn execute(&self, input: In) -> Result<Out, Err> {
        self(input).await
    }
}

/// A key identifying a use case slot. Use cases are named by the Rust
/// type of their marker struct (`struct VerifyThingAttachedToCertificate;`),
/// mirroring the `Class<Input, Output, Error>` lookup key from the
/// original design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UseCaseKey(TypeId);

/// Singleton vs. per-lookup scope for a registered use case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Singleton,
    PerLookup,
}

struct Entry {
    scope: Scope,
    factory: Box<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>,
    singleton: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

/// The IoC container. `Marker` is a zero-sized type naming the use case
/// (e.g. `struct VerifyThingAttachedToCertificate;`); `T` is the
/// concrete implementation type resolved for that marker.
#[derive(Default)]
pub struct UseCaseRegistry {
    entries: RwLock<HashMap<UseCaseKey, Entry>>,
}

impl UseCaseRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `value` under the key `Marker`, with the given scope.
    /// For `Scope::Singleton`, the same `Arc<T>` is returned from every
    /// `resolve::<Marker, T>()` call; for `Scope::PerLookup`, `factory`
    /// is invoked fresh each time.
    pub fn register<Marker: 'static, T: Send + Sync + 'static>(
        &self,
        scope: Scope,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) {
        let key = UseCaseKey(TypeId::of::<Marker>());
        let entry = Entry {
            scope,
            factory: Box::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>),
            singleton: RwLock::new(None),
        };
        self.entries.write().unwrap().insert(key, entry);
    }

    /// Resolve the implementation registered for `Marker`, constructor-
    /// injecting nothing further (dependencies are closed over by the
    /// factory at registration time, i.e. explicit wiring at process
    /// start per §9).
    pub fn resolve<Marker: 'static, T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let key = UseCaseKey(TypeId::of::<Marker>());
        let entries = self.entries.read().unwrap();
        let entry = entries.get(&key)?;
        let any = match entry.scope {
            Scope::Singleton => {
                if let Some(existing) = entry.singleton.read().unwrap().clone() {
                    existing
                } else {
                    let fresh = (entry.factory)();
                    *entry.singleton.write().unwrap() = Some(fresh.clone());
                    fresh
                }
            }
            Scope::PerLookup => (entry.factory)(),
        };
        any.downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Greeter;
    struct GreeterImpl(String);

    struct Counter;

    #[test]
    fn singleton_scope_returns_same_instance() {
        let registry = UseCaseRegistry::new();
        let build_count = Arc::new(AtomicUsize::new(0));
        let build_count2 = build_count.clone();
        registry.register::<Greeter, GreeterImpl>(Scope::Singleton, move || {
            build_count2.fetch_add(1, Ordering::SeqCst);
            GreeterImpl("hello".into())
        });

        let a = registry.resolve::<Greeter, GreeterImpl>().unwrap();
        let b = registry.resolve::<Greeter, GreeterImpl>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_lookup_scope_rebuilds_every_time() {
        let registry = UseCaseRegistry::new();
        let build_count = Arc::new(AtomicUsize::new(0));
        let build_count2 = build_count.clone();
        registry.register::<Counter, AtomicUsize>(Scope::PerLookup, move || {
            build_count2.fetch_add(1, Ordering::SeqCst);
            AtomicUsize::new(0)
        });

        let _a = registry.resolve::<Counter, AtomicUsize>().unwrap();
        let _b = registry.resolve::<Counter, AtomicUsize>().unwrap();
        assert_eq!(build_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregistered_marker_resolves_to_none() {
        let registry = UseCaseRegistry::new();
        assert!(registry.resolve::<Greeter, GreeterImpl>().is_none());
    }
}
