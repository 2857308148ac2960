//! Ordered extension registry.
//!
//! Extensions are cross-cutting hooks. Each one reports a name, an order number
//! and up to three optional capabilities. The ordered view (ascending `order`,
//! ties kept in registration sequence) is computed once on first use and then
//! frozen: it drives both lifecycle notification order and the interceptor chain.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use crate::catalog::RegistryError;
use crate::contracts::Service;
use crate::interceptor::{CallInterceptor, InterceptorChain};

/// A pluggable, ordered hook.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Ascending sort key. Defaults to `0`.
    fn order(&self) -> i32 {
        0
    }

    fn as_service_hook(&self) -> Option<&dyn ServiceHook> {
        None
    }

    fn as_runnable(&self) -> Option<&dyn RunnableExtension> {
        None
    }

    fn as_interceptor(&self) -> Option<&dyn CallInterceptor> {
        None
    }
}

/// Notified of every created service, at creation time.
pub trait ServiceHook: Send + Sync {
    /// # Errors
    /// An error aborts the create phase.
    fn register_service(&self, name: &str, service: &Arc<dyn Service>) -> anyhow::Result<()>;
}

/// Started once, after every service is created and bound and before setup.
#[async_trait]
pub trait RunnableExtension: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
}

type OrderedView = Arc<[Arc<dyn Extension>]>;

/// Registry of extensions with a lazily computed, immutable ordering.
#[derive(Default)]
pub struct ExtensionRegistry {
    registered: Mutex<Vec<Arc<dyn Extension>>>,
    ordered: OnceLock<OrderedView>,
    chain: OnceLock<InterceptorChain>,
}

impl ExtensionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension.
    ///
    /// # Errors
    /// Returns `DuplicateExtension` on a name collision, or `Sealed` once the
    /// ordered view has been computed.
    pub fn register(&self, extension: Arc<dyn Extension>) -> Result<(), RegistryError> {
        let mut registered = self.registered.lock();
        if self.ordered.get().is_some() {
            return Err(RegistryError::Sealed);
        }

        let name = extension.name();
        if registered.iter().any(|existing| existing.name() == name) {
            return Err(RegistryError::DuplicateExtension {
                name: name.to_owned(),
            });
        }

        tracing::debug!(extension = name, order = extension.order(), "extension registered");
        registered.push(extension);
        Ok(())
    }

    /// Extensions sorted by `order`, stable. Computed once, then cached.
    pub fn ordered_view(&self) -> OrderedView {
        self.ordered
            .get_or_init(|| {
                let mut sorted = self.registered.lock().clone();
                sorted.sort_by_key(|e| e.order());
                sorted.into()
            })
            .clone()
    }

    /// The interceptor-capable subset of the ordered view.
    pub fn interceptor_chain(&self) -> InterceptorChain {
        self.chain
            .get_or_init(|| InterceptorChain::new(self.ordered_view().iter().cloned()))
            .clone()
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.ordered.get().is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registered.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registered.lock().is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    struct Ext {
        name: &'static str,
        order: i32,
    }

    impl Extension for Ext {
        fn name(&self) -> &str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
    }

    fn ext(name: &'static str, order: i32) -> Arc<dyn Extension> {
        Arc::new(Ext { name, order })
    }

    #[test]
    fn ordering_is_a_stable_sort() {
        let registry = ExtensionRegistry::new();
        registry.register(ext("first-five", 5)).unwrap();
        registry.register(ext("one", 1)).unwrap();
        registry.register(ext("second-five", 5)).unwrap();
        registry.register(ext("two", 2)).unwrap();

        let names: Vec<String> = registry
            .ordered_view()
            .iter()
            .map(|e| e.name().to_owned())
            .collect();
        assert_eq!(names, vec!["one", "two", "first-five", "second-five"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ExtensionRegistry::new();
        registry.register(ext("audit", 1)).unwrap();

        let err = registry.register(ext("audit", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateExtension { ref name } if name == "audit"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_names_are_accepted() {
        let registry = ExtensionRegistry::new();
        registry.register(ext("a", 0)).unwrap();
        registry.register(ext("b", 0)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registration_after_ordering_is_sealed() {
        let registry = ExtensionRegistry::new();
        registry.register(ext("a", 0)).unwrap();
        let first = registry.ordered_view();
        assert!(registry.is_sealed());

        assert!(matches!(
            registry.register(ext("late", -1)),
            Err(RegistryError::Sealed)
        ));
        assert!(Arc::ptr_eq(&first, &registry.ordered_view()));
    }

    #[test]
    fn chain_only_holds_interceptors() {
        let registry = ExtensionRegistry::new();
        registry.register(ext("plain", 0)).unwrap();
        assert!(registry.interceptor_chain().is_empty());
    }
}
