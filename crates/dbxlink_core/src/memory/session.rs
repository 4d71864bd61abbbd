//! Per-client session over the shared memory store.

use super::key::{global_name, split_key, NodePath, Subscript};
use super::{Store, Tree, DEFAULT_NAMESPACE};
use crate::engine::{Engine, EngineResult, Reply, TransactionVerdict};
use crate::status::{EngineError, ErrorKind};
use dbxlink_codec::{Arg, ArgView, Command, DataType, Sort};
use parking_lot::Mutex;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace};

/// Deepest transaction nesting a session accepts.
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

struct Undo {
    namespace: String,
    path: NodePath,
    previous: Option<Vec<u8>>,
}

struct Frame {
    thread: ThreadId,
    undo: Vec<Undo>,
}

struct SessionState {
    namespace: String,
    frames: Vec<Frame>,
}

/// Change log of one mutation, kept only while a transaction is open.
struct Journal {
    active: bool,
    namespace: String,
    entries: Vec<Undo>,
}

impl Journal {
    fn record(&mut self, tree: &Tree, path: &NodePath) {
        if self.active {
            self.entries.push(Undo {
                namespace: self.namespace.clone(),
                path: path.clone(),
                previous: tree.get(path).cloned(),
            });
        }
    }
}

/// One client's view of a [`MemoryEngine`](super::MemoryEngine).
///
/// Transactions are pinned: while one is open, every call must come from
/// the thread that opened the innermost level.
pub struct MemorySession {
    id: u64,
    store: Arc<Store>,
    state: Mutex<SessionState>,
}

impl MemorySession {
    pub(crate) fn new(id: u64, store: Arc<Store>) -> Self {
        Self {
            id,
            store,
            state: Mutex::new(SessionState {
                namespace: DEFAULT_NAMESPACE.to_string(),
                frames: Vec::new(),
            }),
        }
    }

    /// Session identifier, unique per engine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Currently selected namespace.
    pub fn namespace(&self) -> String {
        self.state.lock().namespace.clone()
    }

    fn check_affinity(&self) -> EngineResult<()> {
        let state = self.state.lock();
        match state.frames.last() {
            Some(frame) if frame.thread != thread::current().id() => Err(EngineError::new(
                ErrorKind::ThreadAffinity,
                format!(
                    "transaction level {} is pinned to another thread",
                    state.frames.len()
                ),
            )),
            _ => Ok(()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tree) -> T) -> T {
        let namespace = self.namespace();
        self.store.read(&namespace, f)
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Tree, &mut Journal) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let (namespace, active) = {
            let state = self.state.lock();
            (state.namespace.clone(), !state.frames.is_empty())
        };
        let mut journal = Journal {
            active,
            namespace: namespace.clone(),
            entries: Vec::new(),
        };
        let result = self.store.write(&namespace, |tree| f(tree, &mut journal));
        if !journal.entries.is_empty() {
            if let Some(frame) = self.state.lock().frames.last_mut() {
                frame.undo.append(&mut journal.entries);
            }
        }
        result
    }

    fn rollback(&self, undo: Vec<Undo>) {
        let mut spaces = self.store.namespaces.lock();
        for entry in undo.into_iter().rev() {
            let tree = spaces.entry(entry.namespace).or_default();
            match entry.previous {
                Some(value) => {
                    tree.insert(entry.path, value);
                }
                None => {
                    tree.remove(&entry.path);
                }
            }
        }
    }

    fn get(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, _) = split_key(args)?;
        self.read(|tree| tree.get(&path).cloned())
            .map(Reply::bytes)
            .ok_or_else(|| EngineError::new(ErrorKind::Undefined, path.to_string()))
    }

    fn set(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, rest) = split_key(args)?;
        let value = required(rest, 0, "value")?.to_bytes().into_owned();
        require_subscript_free_value(&path)?;
        self.mutate(|tree, journal| {
            set_node(tree, journal, path, value);
            Ok(())
        })?;
        Ok(Reply::empty())
    }

    fn defined(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, _) = split_key(args)?;
        let status = self.read(|tree| {
            let has_data = tree.contains_key(&path);
            let has_children = tree
                .range((Excluded(&path), Unbounded))
                .next()
                .is_some_and(|(k, _)| path.contains(k));
            i64::from(has_data) + if has_children { 10 } else { 0 }
        });
        Ok(Reply::integer(status))
    }

    fn delete(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, _) = split_key(args)?;
        self.mutate(|tree, journal| {
            kill_node(tree, journal, &path);
            Ok(())
        })?;
        Ok(Reply::empty())
    }

    fn order(&self, args: &[ArgView<'_>], dir: Direction, with_data: bool) -> EngineResult<Reply> {
        let (path, _) = split_key(args)?;
        let Some((from, parent)) = path.subs.split_last() else {
            return Err(EngineError::new(
                ErrorKind::Subscript,
                format!("{path} has no subscript to advance"),
            ));
        };

        let found = self.read(|tree| {
            let sub = sibling(tree, &path.global, parent, from, dir)?;
            let mut subs = parent.to_vec();
            subs.push(sub.clone());
            let data = tree
                .get(&NodePath {
                    global: path.global.clone(),
                    subs,
                })
                .cloned();
            Some((sub, data))
        });

        Ok(match (found, with_data) {
            (None, false) => Reply::empty(),
            (None, true) => Reply::blocks(&[]),
            (Some((sub, _)), false) => Reply::bytes(sub.to_bytes()),
            (Some((sub, data)), true) => {
                let sub = sub.to_bytes();
                match data {
                    Some(data) => Reply::blocks(&[
                        (Sort::Subscript, sub.as_slice()),
                        (Sort::Data, data.as_slice()),
                    ]),
                    None => Reply::blocks(&[(Sort::Subscript, sub.as_slice())]),
                }
            }
        })
    }

    fn query(&self, args: &[ArgView<'_>], dir: Direction, with_data: bool) -> EngineResult<Reply> {
        let (path, _) = split_key(args)?;
        let found = self.read(|tree| {
            let neighbour = match dir {
                Direction::Forward => tree.range((Excluded(&path), Unbounded)).next(),
                Direction::Backward => tree.range(..&path).next_back(),
            };
            neighbour
                .filter(|(k, _)| k.global == path.global && !k.subs.is_empty())
                .map(|(k, v)| (k.subs.clone(), v.clone()))
        });

        let Some((subs, data)) = found else {
            return Ok(Reply::blocks(&[]));
        };
        let encoded: Vec<Vec<u8>> = subs.iter().map(Subscript::to_bytes).collect();
        let mut parts: Vec<(Sort, &[u8])> = encoded
            .iter()
            .map(|s| (Sort::Subscript, s.as_slice()))
            .collect();
        if with_data {
            parts.push((Sort::Data, data.as_slice()));
        }
        Ok(Reply::blocks(&parts))
    }

    fn increment(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, rest) = split_key(args)?;
        let by = match rest.first() {
            Some(arg) => Number::parse(&arg.text()).ok_or_else(|| {
                EngineError::new(ErrorKind::Syntax, format!("increment {:?} is not numeric", arg.text()))
            })?,
            None => Number::Int(1),
        };

        self.mutate(|tree, journal| {
            let current = tree
                .get(&path)
                .and_then(|v| Number::parse(&String::from_utf8_lossy(v)))
                .unwrap_or(Number::Int(0));
            let next = current.add(by);
            let reply = next.reply();
            set_node(tree, journal, path, reply.data.clone());
            Ok(reply)
        })
    }

    fn lock(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, rest) = split_key(args)?;
        let timeout = rest
            .first()
            .and_then(ArgView::as_f64)
            .and_then(lock_timeout);
        let acquired = self
            .store
            .lock_node(self.id, (self.namespace(), path), timeout);
        Ok(Reply::integer(i64::from(acquired)))
    }

    fn unlock(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (path, _) = split_key(args)?;
        let released = self.store.unlock_node(self.id, &(self.namespace(), path));
        Ok(Reply::integer(i64::from(released)))
    }

    fn merge(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let (target, rest) = split_key(args)?;
        let (source, _) = split_key(rest)?;
        if target == source {
            return Ok(Reply::empty());
        }
        if target.contains(&source) || source.contains(&target) {
            return Err(EngineError::new(
                ErrorKind::Syntax,
                format!("cannot merge overlapping {source} and {target}"),
            ));
        }
        self.mutate(|tree, journal| {
            let copies: Vec<(NodePath, Vec<u8>)> = tree
                .range(&source..)
                .take_while(|(k, _)| source.contains(k))
                .map(|(k, v)| (k.rebase(&source, &target), v.clone()))
                .collect();
            for (path, value) in copies {
                set_node(tree, journal, path, value);
            }
            Ok(())
        })?;
        Ok(Reply::empty())
    }

    fn directory(&self, args: &[ArgView<'_>], dir: Direction) -> EngineResult<Reply> {
        let from = match args.first() {
            Some(arg) if !arg.is_empty() => global_name(&arg.text())?,
            _ => String::new(),
        };
        let found = self.read(|tree| {
            let mut names = tree.keys().map(|k| k.global.as_str());
            match dir {
                Direction::Forward => names
                    .find(|g| from.is_empty() || *g > from.as_str())
                    .map(str::to_string),
                Direction::Backward => names
                    .filter(|g| from.is_empty() || *g < from.as_str())
                    .last()
                    .map(str::to_string),
            }
        });
        Ok(match found {
            Some(name) => Reply::text(format!("^{name}")),
            None => Reply::empty(),
        })
    }

    fn function(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let name = required(args, 0, "function name")?.text();
        let routine = self
            .store
            .routine(&name)
            .ok_or_else(|| EngineError::new(ErrorKind::UnknownFunction, name.to_string()))?;
        routine(&owned_args(&args[1..])?)
    }

    fn class_method(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let class = required(args, 0, "class name")?.text();
        let method = required(args, 1, "method name")?.text();
        if method == "%New" {
            if !self.store.class_exists(&class) {
                return Err(EngineError::new(ErrorKind::UnknownFunction, class.to_string()));
            }
            let handle = self.store.create_object(self.id, &class);
            trace!(class = %class, handle, "object created");
            return Ok(Reply::object_ref(handle));
        }
        let routine = self.store.class_method(&class, &method).ok_or_else(|| {
            EngineError::new(ErrorKind::UnknownFunction, format!("{class}.{method}"))
        })?;
        routine(&owned_args(&args[2..])?)
    }

    fn get_property(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let handle = object_handle(required(args, 0, "object reference")?)?;
        let name = required(args, 1, "property name")?.text();
        self.store.with_object(handle, |object| {
            Ok(Reply::bytes(object.property(&name).unwrap_or_default()))
        })
    }

    fn set_property(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let handle = object_handle(required(args, 0, "object reference")?)?;
        let name = required(args, 1, "property name")?.text().into_owned();
        let value = required(args, 2, "value")?.to_bytes().into_owned();
        self.store.with_object(handle, |object| {
            object.set_property(name, value);
            Ok(Reply::empty())
        })
    }

    fn invoke_method(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let handle = object_handle(required(args, 0, "object reference")?)?;
        let name = required(args, 1, "method name")?.text();
        self.store.invoke(handle, &name, &owned_args(&args[2..])?)
    }

    fn close_object(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let handle = object_handle(required(args, 0, "object reference")?)?;
        self.store.close_object(handle)?;
        Ok(Reply::empty())
    }

    fn set_namespace(&self, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        let name = required(args, 0, "namespace")?.text().to_uppercase();
        if !self.store.has_namespace(&name) {
            return Err(EngineError::new(ErrorKind::Namespace, name));
        }
        self.state.lock().namespace = name;
        Ok(Reply::empty())
    }
}

impl Engine for MemorySession {
    fn call(&self, command: Command, args: &[ArgView<'_>]) -> EngineResult<Reply> {
        self.check_affinity()?;
        match command {
            Command::Open | Command::Close => Ok(Reply::empty()),
            Command::NamespaceGet => Ok(Reply::text(self.namespace())),
            Command::NamespaceSet => self.set_namespace(args),
            Command::Get => self.get(args),
            Command::Set => self.set(args),
            Command::Defined => self.defined(args),
            Command::Delete => self.delete(args),
            Command::Next => self.order(args, Direction::Forward, false),
            Command::Previous => self.order(args, Direction::Backward, false),
            Command::NextData => self.order(args, Direction::Forward, true),
            Command::PreviousData => self.order(args, Direction::Backward, true),
            Command::NodeNext => self.query(args, Direction::Forward, false),
            Command::NodePrevious => self.query(args, Direction::Backward, false),
            Command::NodeNextData => self.query(args, Direction::Forward, true),
            Command::NodePreviousData => self.query(args, Direction::Backward, true),
            Command::Increment => self.increment(args),
            Command::Lock => self.lock(args),
            Command::Unlock => self.unlock(args),
            Command::Merge => self.merge(args),
            Command::Function => self.function(args),
            Command::ClassMethod => self.class_method(args),
            Command::GetProperty => self.get_property(args),
            Command::SetProperty => self.set_property(args),
            Command::InvokeMethod => self.invoke_method(args),
            Command::CloseObject => self.close_object(args),
            Command::DirectoryNext => self.directory(args, Direction::Forward),
            Command::DirectoryPrevious => self.directory(args, Direction::Backward),
            Command::TLevel => Ok(Reply::integer(i64::from(self.transaction_level()))),
            Command::TStart | Command::TCommit | Command::TRollback => Err(EngineError::new(
                ErrorKind::Syntax,
                format!("{command} is not a direct call"),
            )),
        }
    }

    fn run_transaction(
        &self,
        body: &mut dyn FnMut() -> TransactionVerdict,
    ) -> EngineResult<TransactionVerdict> {
        let level = {
            let mut state = self.state.lock();
            if state.frames.len() >= MAX_NESTING {
                return Err(EngineError::new(
                    ErrorKind::Other,
                    format!("transaction nesting exceeds {MAX_NESTING}"),
                ));
            }
            state.frames.push(Frame {
                thread: thread::current().id(),
                undo: Vec::new(),
            });
            state.frames.len()
        };
        debug!(session = self.id, level, "transaction started");

        let verdict = body();

        // Our frame and anything left open above it.
        let mut frames = {
            let mut state = self.state.lock();
            let split = (level - 1).min(state.frames.len());
            state.frames.split_off(split)
        };
        let own = if frames.is_empty() {
            None
        } else {
            Some(frames.remove(0))
        };
        for abandoned in frames.into_iter().rev() {
            self.rollback(abandoned.undo);
        }
        if let Some(frame) = own {
            match verdict {
                TransactionVerdict::Rollback => self.rollback(frame.undo),
                TransactionVerdict::Commit => {
                    let mut undo = frame.undo;
                    if let Some(parent) = self.state.lock().frames.last_mut() {
                        parent.undo.append(&mut undo);
                    }
                }
            }
        }
        debug!(session = self.id, level, ?verdict, "transaction finished");
        Ok(verdict)
    }

    fn transaction_level(&self) -> u32 {
        u32::try_from(self.state.lock().frames.len()).unwrap_or(u32::MAX)
    }

    fn version(&self) -> String {
        self.store.version.clone()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let frames = std::mem::take(&mut self.state.get_mut().frames);
        for frame in frames.into_iter().rev() {
            self.rollback(frame.undo);
        }
        self.store.release_locks(self.id);
        self.store.close_objects(self.id);
    }
}

fn set_node(tree: &mut Tree, journal: &mut Journal, path: NodePath, value: Vec<u8>) {
    journal.record(tree, &path);
    tree.insert(path, value);
}

fn kill_node(tree: &mut Tree, journal: &mut Journal, path: &NodePath) {
    let doomed: Vec<NodePath> = tree
        .range(path..)
        .take_while(|(k, _)| path.contains(k))
        .map(|(k, _)| k.clone())
        .collect();
    for key in doomed {
        journal.record(tree, &key);
        tree.remove(&key);
    }
}

fn sibling(
    tree: &Tree,
    global: &str,
    parent: &[Subscript],
    from: &Subscript,
    dir: Direction,
) -> Option<Subscript> {
    let start = NodePath {
        global: global.to_string(),
        subs: parent.to_vec(),
    };
    let mut children = tree
        .range(&start..)
        .take_while(|(k, _)| start.contains(k))
        .filter_map(|(k, _)| k.subs.get(parent.len()));
    match dir {
        Direction::Forward => children.find(|s| from.is_empty() || *s > from).cloned(),
        Direction::Backward => children
            .filter(|s| from.is_empty() || *s < from)
            .last()
            .cloned(),
    }
}

fn require_subscript_free_value(path: &NodePath) -> EngineResult<()> {
    if path.subs.iter().any(Subscript::is_empty) {
        return Err(EngineError::new(
            ErrorKind::Subscript,
            format!("{path} has a null subscript"),
        ));
    }
    Ok(())
}

fn required<'b, 'a>(args: &'b [ArgView<'a>], index: usize, what: &str) -> EngineResult<&'b ArgView<'a>> {
    args.get(index)
        .ok_or_else(|| EngineError::new(ErrorKind::Syntax, format!("missing {what}")))
}

fn owned_args(args: &[ArgView<'_>]) -> EngineResult<Vec<Arg>> {
    args.iter()
        .map(|a| {
            a.to_arg()
                .map_err(|e| EngineError::new(ErrorKind::Syntax, e.to_string()))
        })
        .collect()
}

fn object_handle(arg: &ArgView<'_>) -> EngineResult<u64> {
    arg.as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .filter(|&n| n != 0)
        .ok_or_else(|| EngineError::new(ErrorKind::InvalidObject, arg.text().into_owned()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Some(Number::Int(0));
        }
        text.parse::<i64>()
            .map(Number::Int)
            .or_else(|_| text.parse::<f64>().map(Number::Float))
            .ok()
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(f) => f,
        }
    }

    fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(sum) => Number::Int(sum),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn reply(self) -> Reply {
        match self {
            Number::Int(n) => Reply::integer(n),
            Number::Float(f) => Reply {
                ty: DataType::Double,
                data: f.to_string().into_bytes(),
            },
        }
    }
}

/// Converts a lock timeout in seconds; one too large to represent waits
/// forever.
fn lock_timeout(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0)).ok()
}

#[cfg(test)]
mod tests {
    use super::super::MemoryEngine;
    use super::*;

    fn key<'a>(global: &'a str, subs: &[&'a str]) -> Vec<ArgView<'a>> {
        let mut args = vec![ArgView::new(Sort::GlobalName, DataType::Str8, global.as_bytes())];
        args.extend(
            subs.iter()
                .map(|s| ArgView::new(Sort::Subscript, DataType::Str8, s.as_bytes())),
        );
        args
    }

    fn with_data<'a>(mut args: Vec<ArgView<'a>>, data: &'a str) -> Vec<ArgView<'a>> {
        args.push(ArgView::new(Sort::Data, DataType::Str8, data.as_bytes()));
        args
    }

    fn text(reply: EngineResult<Reply>) -> String {
        String::from_utf8(reply.unwrap().data).unwrap()
    }

    #[test]
    fn set_get_kill() {
        let session = MemoryEngine::new().session();
        session.call(Command::Set, &with_data(key("^A", &["1"]), "x")).unwrap();
        assert_eq!(text(session.call(Command::Get, &key("^A", &["1"]))), "x");

        let err = session.call(Command::Get, &key("^A", &["2"])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Undefined);
        assert_eq!(err.message, "^A(2)");

        session.call(Command::Delete, &key("^A", &[])).unwrap();
        assert!(session.call(Command::Get, &key("^A", &["1"])).is_err());
    }

    #[test]
    fn defined_reports_data_and_children() {
        let session = MemoryEngine::new().session();
        session.call(Command::Set, &with_data(key("^D", &["1"]), "a")).unwrap();
        session.call(Command::Set, &with_data(key("^D", &["1", "x"]), "b")).unwrap();
        session.call(Command::Set, &with_data(key("^D", &["2", "y"]), "c")).unwrap();

        let defined = |subs: &[&str]| text(session.call(Command::Defined, &key("^D", subs)));
        assert_eq!(defined(&["1"]), "11");
        assert_eq!(defined(&["2"]), "10");
        assert_eq!(defined(&["1", "x"]), "1");
        assert_eq!(defined(&["3"]), "0");
    }

    #[test]
    fn order_walks_siblings() {
        let session = MemoryEngine::new().session();
        for sub in ["10", "2", "b", "a"] {
            session.call(Command::Set, &with_data(key("^O", &[sub]), sub)).unwrap();
        }
        let mut seen = Vec::new();
        let mut cursor = String::new();
        loop {
            let next = {
                let args = key("^O", &[cursor.as_str()]);
                text(session.call(Command::Next, &args))
            };
            if next.is_empty() {
                break;
            }
            seen.push(next.clone());
            cursor = next;
        }
        assert_eq!(seen, ["2", "10", "a", "b"]);
        assert_eq!(text(session.call(Command::Previous, &key("^O", &[""]))), "b");
    }

    #[test]
    fn query_walks_nodes_depth_first() {
        let session = MemoryEngine::new().session();
        session.call(Command::Set, &with_data(key("^Q", &["1"]), "a")).unwrap();
        session.call(Command::Set, &with_data(key("^Q", &["1", "2"]), "b")).unwrap();
        session.call(Command::Set, &with_data(key("^Q", &["3"]), "c")).unwrap();

        let reply = session.call(Command::NodeNextData, &key("^Q", &["1"])).unwrap();
        let views = dbxlink_codec::BlockReader::new(&reply.data).collect_views().unwrap();
        let parts: Vec<String> = views.iter().map(|v| v.text().into_owned()).collect();
        assert_eq!(parts, ["1", "2", "b"]);

        let reply = session.call(Command::NodeNext, &key("^Q", &["3"])).unwrap();
        assert!(reply.data.is_empty());
    }

    #[test]
    fn increment_integers_and_doubles() {
        let session = MemoryEngine::new().session();
        assert_eq!(text(session.call(Command::Increment, &key("^C", &[]))), "1");
        assert_eq!(text(session.call(Command::Increment, &with_data(key("^C", &[]), "5"))), "6");
        let reply = session.call(Command::Increment, &with_data(key("^C", &[]), "0.5")).unwrap();
        assert_eq!(reply.ty, DataType::Double);
        assert_eq!(String::from_utf8(reply.data).unwrap(), "6.5");
    }

    #[test]
    fn merge_copies_subtree() {
        let session = MemoryEngine::new().session();
        session.call(Command::Set, &with_data(key("^S", &["1"]), "a")).unwrap();
        session.call(Command::Set, &with_data(key("^S", &["1", "k"]), "b")).unwrap();
        let mut args = key("^T", &["x"]);
        args.extend(key("^S", &["1"]));
        session.call(Command::Merge, &args).unwrap();
        assert_eq!(text(session.call(Command::Get, &key("^T", &["x", "k"]))), "b");
        assert_eq!(text(session.call(Command::Get, &key("^T", &["x"]))), "a");
    }

    #[test]
    fn locks_are_exclusive_between_sessions() {
        let engine = MemoryEngine::new();
        let first = engine.session();
        let second = engine.session();
        let timeout = |s: &MemorySession| {
            text(s.call(Command::Lock, &with_data(key("^L", &["1"]), "0.05")))
        };
        assert_eq!(timeout(&first), "1");
        assert_eq!(timeout(&second), "0");
        assert_eq!(text(first.call(Command::Unlock, &key("^L", &["1"]))), "1");
        assert_eq!(timeout(&second), "1");
        drop(second);
        assert_eq!(engine.lock_count(), 0);
    }

    #[test]
    fn oversized_lock_timeouts_wait_forever() {
        assert_eq!(lock_timeout(f64::INFINITY), None);
        assert_eq!(lock_timeout(1e30), None);
        assert_eq!(lock_timeout(-3.0), Some(Duration::ZERO));
        assert_eq!(lock_timeout(0.25), Some(Duration::from_millis(250)));

        let session = MemoryEngine::new().session();
        for timeout in ["inf", "1e30"] {
            assert_eq!(
                text(session.call(Command::Lock, &with_data(key("^Big", &[]), timeout))),
                "1"
            );
        }
        assert!(session
            .store
            .lock_node(session.id, (session.namespace(), NodePath::root("Big")), Some(Duration::MAX)));
    }

    #[test]
    fn rollback_restores_previous_values() {
        let session = MemoryEngine::new().session();
        session.call(Command::Set, &with_data(key("^R", &["1"]), "old")).unwrap();
        let verdict = session
            .run_transaction(&mut || {
                session.call(Command::Set, &with_data(key("^R", &["1"]), "new")).unwrap();
                session.call(Command::Set, &with_data(key("^R", &["2"]), "added")).unwrap();
                assert_eq!(session.transaction_level(), 1);
                TransactionVerdict::Rollback
            })
            .unwrap();
        assert_eq!(verdict, TransactionVerdict::Rollback);
        assert_eq!(text(session.call(Command::Get, &key("^R", &["1"]))), "old");
        assert!(session.call(Command::Get, &key("^R", &["2"])).is_err());
        assert_eq!(session.transaction_level(), 0);
    }

    #[test]
    fn calls_from_other_threads_are_rejected_inside_transaction() {
        let session = MemoryEngine::new().session();
        session
            .run_transaction(&mut || {
                let err = thread::scope(|s| {
                    s.spawn(|| session.call(Command::Get, &key("^X", &[])))
                        .join()
                        .unwrap()
                })
                .unwrap_err();
                assert_eq!(err.kind, ErrorKind::ThreadAffinity);
                TransactionVerdict::Commit
            })
            .unwrap();
    }

    #[test]
    fn functions_and_objects() {
        let engine = MemoryEngine::new();
        engine.register_function("Add", |args| {
            let sum: i64 = args
                .iter()
                .map(|a| match a {
                    Arg::Int(n) => i64::from(*n),
                    Arg::Int64(n) => *n,
                    _ => 0,
                })
                .sum();
            Ok(Reply::integer(sum))
        });
        engine.register_method("Counter", "Bump", |object, _| {
            let next = object
                .property("n")
                .and_then(|v| std::str::from_utf8(v).ok()?.parse::<i64>().ok())
                .unwrap_or(0)
                + 1;
            object.set_property("n", next.to_string());
            Ok(Reply::integer(next))
        });
        let session = engine.session();

        let args = [
            ArgView::new(Sort::Data, DataType::Str8, b"Add"),
            ArgView::new(Sort::Data, DataType::Integer, b"2"),
            ArgView::new(Sort::Data, DataType::Integer, b"40"),
        ];
        assert_eq!(text(session.call(Command::Function, &args)), "42");

        let created = session
            .call(
                Command::ClassMethod,
                &[
                    ArgView::new(Sort::Data, DataType::Str8, b"Counter"),
                    ArgView::new(Sort::Data, DataType::Str8, b"%New"),
                ],
            )
            .unwrap();
        assert_eq!(created.ty, DataType::ObjectRef);
        let oref = created.data;
        let invoke = [
            ArgView::new(Sort::Data, DataType::ObjectRef, &oref),
            ArgView::new(Sort::Data, DataType::Str8, b"Bump"),
        ];
        session.call(Command::InvokeMethod, &invoke).unwrap();
        assert_eq!(text(session.call(Command::InvokeMethod, &invoke)), "2");

        let missing = session
            .call(
                Command::Function,
                &[ArgView::new(Sort::Data, DataType::Str8, b"Nope")],
            )
            .unwrap_err();
        assert_eq!(missing.kind, ErrorKind::UnknownFunction);

        assert_eq!(engine.object_count(), 1);
        drop(session);
        assert_eq!(engine.object_count(), 0);
    }

    #[test]
    fn namespaces_partition_data() {
        let engine = MemoryEngine::new();
        engine.add_namespace("SAMPLES");
        let session = engine.session();
        session.call(Command::Set, &with_data(key("^N", &[]), "user")).unwrap();
        session
            .call(
                Command::NamespaceSet,
                &[ArgView::new(Sort::Data, DataType::Str8, b"samples")],
            )
            .unwrap();
        assert!(session.call(Command::Get, &key("^N", &[])).is_err());
        assert_eq!(text(session.call(Command::NamespaceGet, &[])), "SAMPLES");

        let err = session
            .call(
                Command::NamespaceSet,
                &[ArgView::new(Sort::Data, DataType::Str8, b"NOWHERE")],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Namespace);
    }

    #[test]
    fn directory_lists_globals() {
        let session = MemoryEngine::new().session();
        for global in ["^B", "^A", "^C"] {
            session.call(Command::Set, &with_data(key(global, &["1"]), "v")).unwrap();
        }
        let next = |from: &str| {
            text(session.call(
                Command::DirectoryNext,
                &[ArgView::new(Sort::Data, DataType::Str8, from.as_bytes())],
            ))
        };
        assert_eq!(next(""), "^A");
        assert_eq!(next("^A"), "^B");
        assert_eq!(next("^C"), "");
    }
}
