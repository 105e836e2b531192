//! Event handlers: one event name bound to one callback plus fixed extra
//! arguments.
//!
//! Handlers are owned by the per-event lists of an [`Instance`]. The plugin
//! that created a handler only keeps a weak reference to it, used to find
//! duplicates when the same binding is connected again.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};

use crate::instance::{Instance, InstanceId};

/// Keyword arguments, compared by value for handler identity.
pub type Kwargs = Map<String, Value>;

type CallbackFn = dyn Fn(&mut Instance, &EventArgs) -> anyhow::Result<()>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Positional and keyword arguments passed to a callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventArgs {
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl EventArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments for an event read off the wire: the raw payload, if any, is
    /// the single positional argument.
    #[must_use]
    pub fn from_payload(payload: Option<&str>) -> Self {
        Self {
            args: payload.map(|p| Value::String(p.to_string())).into_iter().collect(),
            kwargs: Kwargs::new(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Positional argument `idx` as a string, if it is one.
    #[must_use]
    pub fn str_arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).and_then(Value::as_str)
    }

    /// The raw wire payload (first positional argument).
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.str_arg(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Call-time arguments first, then the bound extras. Bound keyword
    /// arguments win on key collision.
    fn merged(&self, bound: &Self) -> Self {
        let mut args = self.args.clone();
        args.extend_from_slice(&bound.args);

        let mut kwargs = self.kwargs.clone();
        kwargs.extend(bound.kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self { args, kwargs }
    }
}

/// A shareable callback. Identity is the allocation: clones of one
/// `Callback` are the same callback, two `Callback::new` calls never are.
#[derive(Clone)]
pub struct Callback {
    name: Rc<str>,
    func: Rc<CallbackFn>,
}

impl Callback {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut Instance, &EventArgs) -> anyhow::Result<()> + 'static,
    {
        Self {
            name: Rc::from(name),
            func: Rc::new(func),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.name).finish()
    }
}

/// A binding of one event to one callback on one instance.
#[derive(Debug)]
pub struct EventHandler {
    id: u64,
    instance: InstanceId,
    plugin: String,
    event: String,
    callback: Callback,
    bound: EventArgs,
}

impl EventHandler {
    pub(crate) fn new(
        instance: InstanceId,
        plugin: &str,
        event: String,
        callback: Callback,
        bound: EventArgs,
    ) -> Self {
        Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            instance,
            plugin: plugin.to_string(),
            event,
            callback,
            bound,
        }
    }

    /// Process-wide, monotonically increasing id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    #[must_use]
    pub const fn instance(&self) -> InstanceId {
        self.instance
    }

    #[must_use]
    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Extra arguments fixed at connect time.
    #[must_use]
    pub fn bound(&self) -> &EventArgs {
        &self.bound
    }

    /// Whether this handler is the binding described by the arguments.
    #[must_use]
    pub fn matches(
        &self,
        instance: InstanceId,
        event: &str,
        callback: &Callback,
        bound: &EventArgs,
    ) -> bool {
        self.instance == instance
            && self.event == event
            && self.callback.same_as(callback)
            && self.bound == *bound
    }

    /// Run the callback with the call-time arguments merged with the bound
    /// extras.
    ///
    /// # Errors
    ///
    /// Returns whatever the callback returns. A panic in the callback is
    /// caught and returned as an error.
    pub fn call(&self, instance: &mut Instance, call_args: &EventArgs) -> anyhow::Result<()> {
        let merged = call_args.merged(&self.bound);
        isolate(|| (self.callback.func)(instance, &merged))
    }
}

/// Run plugin code, turning a panic into an error so it cannot unwind into
/// the multiplexer.
pub(crate) fn isolate<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl fmt::Display for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<handler #{} {} -> {}::{}",
            self.id, self.event, self.plugin, self.callback.name
        )?;
        if !self.bound.args.is_empty() {
            write!(f, " args={}", Value::Array(self.bound.args.clone()))?;
        }
        if !self.bound.kwargs.is_empty() {
            write!(f, " kwargs={}", Value::Object(self.bound.kwargs.clone()))?;
        }
        write!(f, ">")
    }
}
