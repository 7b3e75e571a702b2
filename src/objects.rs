use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type BoxedObject = Box<dyn Any + Send + Sync>;
type ObjectFactory = Arc<dyn Fn() -> anyhow::Result<BoxedObject> + Send + Sync>;

struct StoredObject {
    object: BoxedObject,
    destroy: bool,
}

/// Lazy store for objects shared across handlers within one connection
/// worker.
///
/// Entries tagged `destroy` are reaped between messages; the rest (the DNS
/// resolver, the SPF engine) survive for the lifetime of the worker. Named
/// factories are registered at startup; tests swap in their own factory for
/// `resolver` to inject a scripted DNS client.
#[derive(Default)]
pub struct ObjectStore {
    entries: HashMap<String, StoredObject>,
    factories: HashMap<String, (ObjectFactory, bool)>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a named object. `destroy` tags the created
    /// entry for reaping between messages.
    pub fn register_factory<F>(&mut self, name: &str, destroy: bool, factory: F)
    where
        F: Fn() -> anyhow::Result<BoxedObject> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.to_string(), (Arc::new(factory), destroy));
    }

    /// Store a value directly. Handler-produced message state goes in this
    /// way and is always destroyable.
    pub fn set_object<T: Any + Send + Sync>(&mut self, name: &str, object: T, destroy: bool) {
        self.entries.insert(
            name.to_string(),
            StoredObject {
                object: Box::new(object),
                destroy,
            },
        );
    }

    /// Fetch an object, building it through its factory on first use.
    /// A name with neither an entry nor a factory yields `None`.
    pub fn get_object(&mut self, name: &str) -> anyhow::Result<Option<&BoxedObject>> {
        if !self.entries.contains_key(name) {
            let factory = match self.factories.get(name) {
                Some((factory, destroy)) => (factory.clone(), *destroy),
                None => return Ok(None),
            };
            let object = (factory.0)()?;
            self.entries.insert(
                name.to_string(),
                StoredObject {
                    object,
                    destroy: factory.1,
                },
            );
        }
        Ok(self.entries.get(name).map(|e| &e.object))
    }

    /// Typed view of a stored object.
    pub fn get_ref<T: Any + Send + Sync>(&mut self, name: &str) -> anyhow::Result<Option<&T>> {
        Ok(self.get_object(name)?.and_then(|o| o.downcast_ref::<T>()))
    }

    /// Clone out an `Arc<T>` stored under `name`.
    pub fn get_shared<T: Any + Send + Sync + ?Sized>(
        &mut self,
        name: &str,
    ) -> anyhow::Result<Option<Arc<T>>> {
        Ok(self
            .get_object(name)?
            .and_then(|o| o.downcast_ref::<Arc<T>>())
            .cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Reap every destroyable entry. Runs between messages and at close.
    pub fn destroy_objects(&mut self) {
        self.entries.retain(|_, entry| !entry.destroy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_lazily_and_once() {
        let mut store = ObjectStore::new();
        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = built.clone();
        store.register_factory("resolver", false, move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(42usize))
        });
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(store.get_ref::<usize>("resolver").unwrap(), Some(&42));
        assert_eq!(store.get_ref::<usize>("resolver").unwrap(), Some(&42));
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_name_returns_nothing() {
        let mut store = ObjectStore::new();
        assert!(store.get_object("dmarc_state").unwrap().is_none());
    }

    #[test]
    fn destroy_reaps_only_tagged_entries() {
        let mut store = ObjectStore::new();
        store.set_object("spf_result", String::from("pass"), true);
        store.set_object("resolver", 42usize, false);
        store.destroy_objects();
        assert!(!store.contains("spf_result"));
        assert!(store.contains("resolver"));
    }

    #[test]
    fn shared_arc_objects_clone_out() {
        let mut store = ObjectStore::new();
        store.set_object("resolver", Arc::new(7u32), false);
        let shared: Arc<u32> = store.get_shared("resolver").unwrap().unwrap();
        assert_eq!(*shared, 7);
    }
}
