//! Command dispatch.
//!
//! Every abstract operation funnels through [`Connection::dispatch`]: the
//! arguments are staged into the connection's arena, an execution path is
//! chosen (socket, pinned transaction thread, direct engine call, or the
//! worker pool when deferred), and the result is normalized into an
//! [`Outcome`].

use crate::config::ResultMode;
use crate::connection::Connection;
use crate::error::CoreResult;
use crate::pool::TaskHandle;
use crate::status::EngineError;
use dbxlink_codec::{Arg, ArgView, BlockReader, Command, DataType, Sort};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A global name with subscripts, such as `^Orders(42,"lines")`.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    global: String,
    subs: Vec<Arg>,
}

impl Key {
    /// Creates a key naming the root of `global`.
    pub fn new(global: impl Into<String>) -> Self {
        Self {
            global: global.into(),
            subs: Vec::new(),
        }
    }

    /// Appends a subscript.
    pub fn sub(mut self, subscript: impl Into<Arg>) -> Self {
        self.subs.push(subscript.into());
        self
    }

    /// The global name as given.
    pub fn global(&self) -> &str {
        &self.global
    }

    /// Subscripts, outermost first.
    pub fn subscripts(&self) -> &[Arg] {
        &self.subs
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.global.starts_with('^') {
            write!(f, "^")?;
        }
        write!(f, "{}", self.global)?;
        if self.subs.is_empty() {
            return Ok(());
        }
        write!(f, "(")?;
        for (i, sub) in self.subs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            let (ty, bytes) = sub.encode(false);
            let view = ArgView::new(Sort::Subscript, ty, &bytes);
            match sub {
                Arg::Str(_) | Arg::WStr(_) => write!(f, "\"{}\"", view.text())?,
                _ => write!(f, "{}", view.text())?,
            }
        }
        write!(f, ")")
    }
}

/// One operation and its typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    command: Command,
    args: Vec<(Sort, Arg)>,
}

impl Request {
    /// Creates a request with no arguments.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            args: Vec::new(),
        }
    }

    /// Appends a key as one GLOBAL-NAME block plus SUBSCRIPT blocks.
    pub fn key(mut self, key: &Key) -> Self {
        self.args
            .push((Sort::GlobalName, Arg::text(key.global())));
        self.args.extend(
            key.subscripts()
                .iter()
                .cloned()
                .map(|s| (Sort::Subscript, s)),
        );
        self
    }

    /// Appends a DATA argument.
    pub fn data(mut self, value: impl Into<Arg>) -> Self {
        self.args.push((Sort::Data, value.into()));
        self
    }

    /// Appends an argument with an explicit sort.
    pub fn arg(mut self, sort: Sort, value: Arg) -> Self {
        self.args.push((sort, value));
        self
    }

    /// The requested command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Arguments in wire order.
    pub fn args(&self) -> &[(Sort, Arg)] {
        &self.args
    }
}

/// A decoded result payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Text, decoded per the payload's character width.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

/// Normalized result of one dispatched operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Whether the engine accepted the operation.
    pub ok: bool,
    /// Payload type.
    pub ty: DataType,
    /// Result payload, or the error text when `ok` is false.
    pub payload: Vec<u8>,
    /// Engine error, when `ok` is false.
    pub error: Option<EngineError>,
    /// Presentation requested by the connection.
    pub mode: ResultMode,
}

impl Outcome {
    pub(crate) fn success(ty: DataType, payload: Vec<u8>, mode: ResultMode) -> Self {
        Self {
            ok: true,
            ty,
            payload,
            error: None,
            mode,
        }
    }

    pub(crate) fn failure(error: EngineError, mode: ResultMode) -> Self {
        Self {
            ok: false,
            ty: DataType::Str8,
            payload: error.to_wire_text().into_bytes(),
            error: Some(error),
            mode,
        }
    }

    fn view(&self) -> ArgView<'_> {
        ArgView::new(Sort::Data, self.ty, &self.payload)
    }

    /// Payload as text.
    pub fn text(&self) -> String {
        self.view().text().into_owned()
    }

    /// Payload as raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload in the connection's result mode.
    pub fn value(&self) -> Value {
        match self.mode {
            ResultMode::Text => Value::Text(self.text()),
            ResultMode::Binary => Value::Binary(self.payload.clone()),
        }
    }

    /// Payload as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.view().as_i64()
    }

    /// Payload as a double.
    pub fn as_f64(&self) -> Option<f64> {
        self.view().as_f64()
    }

    /// Object handle, if the payload is an object reference.
    pub fn object_ref(&self) -> Option<u64> {
        if self.ty != DataType::ObjectRef {
            return None;
        }
        self.text().trim().parse().ok()
    }

    /// Sub-blocks of a multi-value payload (subscripts and data).
    pub fn blocks(&self) -> CoreResult<Vec<ArgView<'_>>> {
        Ok(BlockReader::new(&self.payload).collect_views()?)
    }
}

impl Connection {
    /// Executes one request.
    ///
    /// With deferred execution configured the request runs on the worker
    /// pool and this call waits for it.
    pub fn dispatch(&self, request: &Request) -> CoreResult<Outcome> {
        if self.inner.deferred {
            return self.dispatch_deferred(request);
        }
        self.inner.run(request, true)
    }

    /// Executes one request on the worker pool and waits for it.
    pub fn dispatch_deferred(&self, request: &Request) -> CoreResult<Outcome> {
        self.spawn_deferred(request.clone())?.wait()
    }

    /// Queues one request on the worker pool.
    pub fn spawn_deferred(&self, request: Request) -> CoreResult<TaskHandle<Outcome>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .pool()?
            .spawn(move || inner.run(&request, false))
    }

    /// Reads a node; an undefined node yields an empty payload.
    pub fn get(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Get).key(key))
    }

    /// Stores a value at a node.
    pub fn set(&self, key: &Key, value: impl Into<Arg>) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Set).key(key).data(value))
    }

    /// Reports 0, 1, 10 or 11 for no data, data, children, both.
    pub fn defined(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Defined).key(key))
    }

    /// Removes a node and everything beneath it.
    pub fn delete(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Delete).key(key))
    }

    /// Next sibling subscript; an empty last subscript starts the walk.
    pub fn next(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Next).key(key))
    }

    /// Previous sibling subscript.
    pub fn previous(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Previous).key(key))
    }

    /// Next sibling subscript together with its data.
    pub fn next_data(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NextData).key(key))
    }

    /// Previous sibling subscript together with its data.
    pub fn previous_data(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::PreviousData).key(key))
    }

    /// Next node with data, in depth-first order.
    pub fn node_next(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NodeNext).key(key))
    }

    /// Previous node with data, in depth-first order.
    pub fn node_previous(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NodePrevious).key(key))
    }

    /// Next node with data, together with that data.
    pub fn node_next_data(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NodeNextData).key(key))
    }

    /// Previous node with data, together with that data.
    pub fn node_previous_data(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NodePreviousData).key(key))
    }

    /// Adds `by` to a node and returns the new value.
    pub fn increment(&self, key: &Key, by: impl Into<Arg>) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Increment).key(key).data(by))
    }

    /// Locks a node; the payload is 1 if acquired and 0 on timeout.
    pub fn lock(&self, key: &Key, timeout: Option<Duration>) -> CoreResult<Outcome> {
        let mut request = Request::new(Command::Lock).key(key);
        if let Some(timeout) = timeout {
            request = request.data(timeout.as_secs_f64());
        }
        self.dispatch(&request)
    }

    /// Releases one level of a node lock.
    pub fn unlock(&self, key: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Unlock).key(key))
    }

    /// Copies the subtree at `source` under `target`.
    pub fn merge(&self, target: &Key, source: &Key) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::Merge).key(target).key(source))
    }

    /// Opens a transaction; the payload is the new level.
    pub fn tstart(&self) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::TStart))
    }

    /// Reports the nesting level.
    pub fn tlevel(&self) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::TLevel))
    }

    /// Commits the innermost transaction.
    pub fn tcommit(&self) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::TCommit))
    }

    /// Rolls back the innermost transaction.
    pub fn trollback(&self) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::TRollback))
    }

    /// Calls a registered function.
    pub fn function(&self, name: &str, args: &[Arg]) -> CoreResult<Outcome> {
        let mut request = Request::new(Command::Function).data(name);
        for arg in args {
            request = request.data(arg.clone());
        }
        self.dispatch(&request)
    }

    /// Calls a class method; `%New` creates an object.
    pub fn class_method(&self, class: &str, method: &str, args: &[Arg]) -> CoreResult<Outcome> {
        let mut request = Request::new(Command::ClassMethod).data(class).data(method);
        for arg in args {
            request = request.data(arg.clone());
        }
        self.dispatch(&request)
    }

    /// Reads an object property.
    pub fn get_property(&self, object: u64, name: &str) -> CoreResult<Outcome> {
        self.dispatch(
            &Request::new(Command::GetProperty)
                .data(Arg::ObjectRef(object))
                .data(name),
        )
    }

    /// Writes an object property.
    pub fn set_property(&self, object: u64, name: &str, value: impl Into<Arg>) -> CoreResult<Outcome> {
        self.dispatch(
            &Request::new(Command::SetProperty)
                .data(Arg::ObjectRef(object))
                .data(name)
                .data(value),
        )
    }

    /// Invokes an instance method.
    pub fn invoke_method(&self, object: u64, method: &str, args: &[Arg]) -> CoreResult<Outcome> {
        let mut request = Request::new(Command::InvokeMethod)
            .data(Arg::ObjectRef(object))
            .data(method);
        for arg in args {
            request = request.data(arg.clone());
        }
        self.dispatch(&request)
    }

    /// Releases an object.
    pub fn close_object(&self, object: u64) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::CloseObject).data(Arg::ObjectRef(object)))
    }

    /// Current namespace.
    pub fn namespace(&self) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NamespaceGet))
    }

    /// Switches namespace.
    pub fn set_namespace(&self, namespace: &str) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::NamespaceSet).data(namespace))
    }

    /// Next global name after `global` (empty starts the walk).
    pub fn directory_next(&self, global: &str) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::DirectoryNext).data(global))
    }

    /// Previous global name before `global`.
    pub fn directory_previous(&self, global: &str) -> CoreResult<Outcome> {
        self.dispatch(&Request::new(Command::DirectoryPrevious).data(global))
    }
}
