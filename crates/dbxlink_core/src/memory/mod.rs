//! In-memory reference engine.
//!
//! [`MemoryEngine`] is a cheaply clonable handle to a shared store of
//! hierarchical nodes (a global name plus ordered subscripts) partitioned by
//! namespace, together with a lock table, registered functions and a small
//! class/object model. Each client gets its own [`MemorySession`], which
//! carries the session's namespace and transaction frames and implements
//! [`Engine`](crate::Engine).

mod key;
mod session;

pub use key::{NodePath, Subscript};
pub use session::MemorySession;

use crate::engine::{EngineResult, Reply};
use crate::status::{EngineError, ErrorKind};
use dbxlink_codec::Arg;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Namespace selected when a session starts.
pub const DEFAULT_NAMESPACE: &str = "USER";

/// Version string reported by the memory engine.
pub const ENGINE_VERSION: &str = concat!("dbxlink memory engine ", env!("CARGO_PKG_VERSION"));

/// A registered function, called with the decoded arguments.
pub type Routine = Arc<dyn Fn(&[Arg]) -> EngineResult<Reply> + Send + Sync>;

/// A registered instance method.
pub type Method = Arc<dyn Fn(&mut Object, &[Arg]) -> EngineResult<Reply> + Send + Sync>;

pub(crate) type Tree = BTreeMap<NodePath, Vec<u8>>;

/// A live object created through a class's `%New`.
#[derive(Debug, Clone)]
pub struct Object {
    class: String,
    owner: u64,
    properties: BTreeMap<String, Vec<u8>>,
}

impl Object {
    /// Class the object was created from.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Current value of a property.
    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties.get(name).map(Vec::as_slice)
    }

    /// Sets a property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.properties.insert(name.into(), value.into());
    }
}

#[derive(Default)]
struct ClassDef {
    class_methods: HashMap<String, Routine>,
    methods: HashMap<String, Method>,
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    owner: u64,
    count: u32,
}

type LockKey = (String, NodePath);

pub(crate) struct Store {
    namespaces: Mutex<HashMap<String, Tree>>,
    locks: Mutex<HashMap<LockKey, LockEntry>>,
    lock_released: Condvar,
    routines: RwLock<HashMap<String, Routine>>,
    classes: RwLock<HashMap<String, ClassDef>>,
    objects: Mutex<HashMap<u64, Object>>,
    next_object: AtomicU64,
    next_session: AtomicU64,
    version: String,
}

impl Store {
    fn new(version: String) -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(DEFAULT_NAMESPACE.to_string(), Tree::new());
        namespaces.insert("%SYS".to_string(), Tree::new());
        Self {
            namespaces: Mutex::new(namespaces),
            locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            routines: RwLock::new(HashMap::new()),
            classes: RwLock::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            next_object: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
            version,
        }
    }

    pub(crate) fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.lock().contains_key(name)
    }

    pub(crate) fn read<T>(&self, namespace: &str, f: impl FnOnce(&Tree) -> T) -> T {
        let spaces = self.namespaces.lock();
        match spaces.get(namespace) {
            Some(tree) => f(tree),
            None => f(&Tree::new()),
        }
    }

    pub(crate) fn write<T>(&self, namespace: &str, f: impl FnOnce(&mut Tree) -> T) -> T {
        let mut spaces = self.namespaces.lock();
        f(spaces.entry(namespace.to_string()).or_default())
    }

    pub(crate) fn routine(&self, name: &str) -> Option<Routine> {
        self.routines.read().get(name).cloned()
    }

    pub(crate) fn class_exists(&self, class: &str) -> bool {
        self.classes.read().contains_key(class)
    }

    pub(crate) fn class_method(&self, class: &str, name: &str) -> Option<Routine> {
        self.classes
            .read()
            .get(class)
            .and_then(|def| def.class_methods.get(name).cloned())
    }

    fn method(&self, class: &str, name: &str) -> Option<Method> {
        self.classes
            .read()
            .get(class)
            .and_then(|def| def.methods.get(name).cloned())
    }

    /// Acquires (or re-enters) an exclusive lock on one node.
    ///
    /// Returns false if `timeout` elapsed first; `None`, or a timeout past
    /// the end of the clock, waits indefinitely.
    pub(crate) fn lock_node(&self, session: u64, key: LockKey, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut locks = self.locks.lock();
        loop {
            match locks.get(&key).map(|entry| entry.owner) {
                None => {
                    locks.insert(
                        key,
                        LockEntry {
                            owner: session,
                            count: 1,
                        },
                    );
                    return true;
                }
                Some(owner) if owner == session => {
                    if let Some(entry) = locks.get_mut(&key) {
                        entry.count += 1;
                    }
                    return true;
                }
                Some(_) => match deadline {
                    None => self.lock_released.wait(&mut locks),
                    Some(deadline) => {
                        if self.lock_released.wait_until(&mut locks, deadline).timed_out()
                            && locks.contains_key(&key)
                        {
                            return false;
                        }
                    }
                },
            }
        }
    }

    pub(crate) fn unlock_node(&self, session: u64, key: &LockKey) -> bool {
        let mut locks = self.locks.lock();
        let released = match locks.get_mut(key) {
            Some(entry) if entry.owner == session => {
                entry.count -= 1;
                entry.count == 0
            }
            _ => return false,
        };
        if released {
            locks.remove(key);
            self.lock_released.notify_all();
        }
        true
    }

    fn release_locks(&self, session: u64) {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, entry| entry.owner != session);
        if locks.len() != before {
            self.lock_released.notify_all();
        }
    }

    pub(crate) fn create_object(&self, session: u64, class: &str) -> u64 {
        let handle = self.next_object.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().insert(
            handle,
            Object {
                class: class.to_string(),
                owner: session,
                properties: BTreeMap::new(),
            },
        );
        handle
    }

    pub(crate) fn with_object<T>(
        &self,
        handle: u64,
        f: impl FnOnce(&mut Object) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut objects = self.objects.lock();
        let object = objects.get_mut(&handle).ok_or_else(|| invalid_oref(handle))?;
        f(object)
    }

    pub(crate) fn invoke(&self, handle: u64, name: &str, args: &[Arg]) -> EngineResult<Reply> {
        let class = self.with_object(handle, |object| Ok(object.class.clone()))?;
        let method = self.method(&class, name).ok_or_else(|| {
            EngineError::new(ErrorKind::UnknownFunction, format!("{class}.{name}"))
        })?;
        self.with_object(handle, |object| method(object, args))
    }

    pub(crate) fn close_object(&self, handle: u64) -> EngineResult<()> {
        self.objects
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| invalid_oref(handle))
    }

    fn close_objects(&self, session: u64) {
        self.objects.lock().retain(|_, object| object.owner != session);
    }
}

fn invalid_oref(handle: u64) -> EngineError {
    EngineError::new(ErrorKind::InvalidObject, handle.to_string())
}

/// Shared in-memory store.
#[derive(Clone)]
pub struct MemoryEngine {
    store: Arc<Store>,
}

impl MemoryEngine {
    /// Creates an empty store with the `USER` and `%SYS` namespaces.
    pub fn new() -> Self {
        Self::with_version(ENGINE_VERSION)
    }

    /// Creates an empty store that reports `version`.
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            store: Arc::new(Store::new(version.into())),
        }
    }

    /// Opens a new session on the shared store.
    pub fn session(&self) -> MemorySession {
        let id = self.store.next_session.fetch_add(1, Ordering::Relaxed);
        MemorySession::new(id, Arc::clone(&self.store))
    }

    /// Version string reported to clients.
    pub fn version(&self) -> &str {
        &self.store.version
    }

    /// Adds an empty namespace if it does not already exist.
    pub fn add_namespace(&self, name: impl Into<String>) {
        self.store
            .namespaces
            .lock()
            .entry(name.into())
            .or_default();
    }

    /// Returns true if `name` is a known namespace.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.store.has_namespace(name)
    }

    /// Registers a function callable through the function command.
    pub fn register_function<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Arg]) -> EngineResult<Reply> + Send + Sync + 'static,
    {
        self.store.routines.write().insert(name.into(), Arc::new(f));
    }

    /// Declares a class so `%New` can instantiate it.
    pub fn register_class(&self, class: impl Into<String>) {
        self.store.classes.write().entry(class.into()).or_default();
    }

    /// Registers a class method, declaring the class if needed.
    pub fn register_class_method<F>(&self, class: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(&[Arg]) -> EngineResult<Reply> + Send + Sync + 'static,
    {
        self.store
            .classes
            .write()
            .entry(class.into())
            .or_default()
            .class_methods
            .insert(name.into(), Arc::new(f));
    }

    /// Registers an instance method, declaring the class if needed.
    pub fn register_method<F>(&self, class: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Object, &[Arg]) -> EngineResult<Reply> + Send + Sync + 'static,
    {
        self.store
            .classes
            .write()
            .entry(class.into())
            .or_default()
            .methods
            .insert(name.into(), Arc::new(f));
    }

    /// Number of live objects across all sessions.
    pub fn object_count(&self) -> usize {
        self.store.objects.lock().len()
    }

    /// Number of held node locks across all sessions.
    pub fn lock_count(&self) -> usize {
        self.store.locks.lock().len()
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("version", &self.store.version)
            .finish_non_exhaustive()
    }
}
