//! One connected instance: its socket, buffers, identity, handler lists and
//! exports.
//!
//! The multiplexer owns every [`Instance`] through the [`ConnectionTable`] and
//! drives it with [`Instance::feed`] and [`Instance::flush`] when the socket
//! is ready. Everything else (dispatch, hooks, handlers) runs synchronously
//! from inside those two calls.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};
use hive_protocol::{EventCodec, EventRecord, INSTANCE_EXIT, INSTANCE_START, Record};
use serde_json::Value;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, trace, warn};

use crate::error::{DaemonError, Result};
use crate::export::{Export, ExportEntry};
use crate::handler::{EventArgs, EventHandler};
use crate::plugin::{HookKind, PluginSet};

const READ_CHUNK: usize = 8 * 1024;

/// Live instances keyed by id.
pub type ConnectionTable = BTreeMap<InstanceId, Rc<RefCell<Instance>>>;

/// Process-unique key of a connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Accepted, no event seen yet.
    Connected,
    /// Name fixed by the first event record.
    Named,
    /// Start event processed, hooks ran.
    Started,
    Closed,
}

pub struct Instance {
    id: InstanceId,
    stream: Option<Rc<UnixStream>>,
    codec: EventCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    name: Option<String>,
    pid: Option<u32>,
    state: InstanceState,
    handlers: HashMap<String, Vec<Rc<EventHandler>>>,
    exports: HashMap<String, ExportEntry>,
    depth: usize,
    plugins: Rc<PluginSet>,
    table: Weak<RefCell<ConnectionTable>>,
    print_events: bool,
}

impl Instance {
    pub fn new(id: InstanceId, stream: UnixStream, plugins: Rc<PluginSet>) -> Self {
        Self {
            id,
            stream: Some(Rc::new(stream)),
            codec: EventCodec::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            name: None,
            pid: None,
            state: InstanceState::Connected,
            handlers: HashMap::new(),
            exports: HashMap::new(),
            depth: 0,
            plugins,
            table: Weak::new(),
            print_events: false,
        }
    }

    /// Table this instance removes itself from on close.
    #[must_use]
    pub fn with_table(mut self, table: Weak<RefCell<ConnectionTable>>) -> Self {
        self.table = table;
        self
    }

    #[must_use]
    pub const fn with_print_events(mut self, print_events: bool) -> Self {
        self.print_events = print_events;
        self
    }

    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == InstanceState::Closed
    }

    /// The socket, until the instance is closed.
    #[must_use]
    pub fn stream(&self) -> Option<&Rc<UnixStream>> {
        self.stream.as_ref()
    }

    /// Readiness the multiplexer should wait for.
    #[must_use]
    pub fn interest(&self) -> Interest {
        let interest = Interest::READABLE | Interest::ERROR;
        if self.write_buf.is_empty() {
            interest
        } else {
            interest | Interest::WRITABLE
        }
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn pending_output(&self) -> &[u8] {
        &self.write_buf
    }

    #[must_use]
    pub fn plugins(&self) -> &Rc<PluginSet> {
        &self.plugins
    }

    /// Handlers bound to `event`, in dispatch order.
    #[must_use]
    pub fn handlers(&self, event: &str) -> &[Rc<EventHandler>] {
        self.handlers.get(event).map(Vec::as_slice).unwrap_or_default()
    }

    /// Queue a command for the instance. Never blocks.
    pub fn enqueue(&mut self, command: &str) {
        if self.is_closed() {
            trace!("Dropping command for closed instance {}: {}", self, command);
            return;
        }
        if let Err(e) = self.codec.encode(command, &mut self.write_buf) {
            warn!("Dropping command for {}: {}", self, e);
            return;
        }
        trace!("Queued for {}: {}", self, command);
    }

    /// One non-blocking write of the queued bytes.
    pub fn flush(&mut self) {
        if self.write_buf.is_empty() {
            return;
        }
        let result = match &self.stream {
            Some(stream) => stream.try_write(&self.write_buf),
            None => return,
        };

        match result {
            Ok(0) => {
                debug!("Instance {} stopped accepting writes", self);
                self.close();
            }
            Ok(n) => {
                trace!("Wrote {} bytes to {}", n, self);
                self.write_buf.advance(n);
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                debug!("Write to {} failed: {}", self, e);
                self.close();
            }
        }
    }

    /// One non-blocking read, then dispatch every complete line it
    /// finished.
    pub fn feed(&mut self) {
        self.read_buf.reserve(READ_CHUNK);
        let result = match &self.stream {
            Some(stream) => stream.try_read_buf(&mut self.read_buf),
            None => return,
        };

        match result {
            Ok(0) => {
                if !self.read_buf.is_empty() {
                    debug!(
                        "Discarding {} unterminated bytes from {}",
                        self.read_buf.len(),
                        self
                    );
                }
                self.read_buf.clear();
                self.close();
                return;
            }
            Ok(n) => trace!("Read {} bytes from {}", n, self),
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                debug!("Read from {} failed: {}", self, e);
                self.close();
                return;
            }
        }

        while !self.is_closed() {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => break,
                Err(e) => {
                    warn!("Closing {}: {}", self, e);
                    self.close();
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        if self.print_events {
            info!(target: "hive_daemon::echo", "{}", line);
        }

        match Record::parse(line) {
            Ok(Record::Event(record)) => self.handle_record(record),
            Ok(Record::Other(other)) => {
                if !self.print_events {
                    debug!("Ignoring non-event line from {}: {}", self, other);
                }
            }
            Err(e) => warn!("Dropping line from {}: {}", self, e),
        }
    }

    fn handle_record(&mut self, record: EventRecord) {
        match &self.name {
            Some(name) if *name != record.instance => {
                let err = DaemonError::NameMismatch {
                    expected: name.clone(),
                    found: record.instance,
                };
                warn!("Dropping line from {}: {}", self, err);
                return;
            }
            Some(_) => {}
            None => {
                self.name = Some(record.instance);
                if self.state == InstanceState::Connected {
                    self.state = InstanceState::Named;
                }
                info!("Connection {} identified as {}", self.id, self);
            }
        }

        let args = EventArgs::from_payload(record.args.as_deref());
        if let Err(e) = self.dispatch(&record.event, &args) {
            warn!("Rejected {} from {}: {}", record.event, self, e);
        }
    }

    /// Run the built-in handling for `event`, then every bound handler in
    /// binding order.
    ///
    /// Handlers may dispatch further events on the same instance; those run
    /// to completion before the outer dispatch continues.
    ///
    /// # Errors
    ///
    /// Returns an error when the start event is a duplicate or carries no
    /// valid pid. Handlers do not run in that case. Handler failures are
    /// logged, never returned.
    pub fn dispatch(&mut self, event: &str, args: &EventArgs) -> Result<()> {
        let event = event.to_uppercase();

        self.depth += 1;
        debug!(
            "{}{} {} {}",
            "  ".repeat(self.depth - 1),
            self,
            event,
            args.payload().unwrap_or_default()
        );

        let result = self.run_builtin(&event, args);
        if result.is_ok() {
            let handlers = self.handlers.get(&event).cloned().unwrap_or_default();
            for handler in handlers {
                if let Err(e) = handler.call(self, args) {
                    error!("{} failed: {:#}", handler, e);
                }
            }
        }

        self.depth -= 1;
        result
    }

    fn run_builtin(&mut self, event: &str, args: &EventArgs) -> Result<()> {
        match event {
            INSTANCE_START => self.start(args.payload()),
            INSTANCE_EXIT => {
                self.close();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start(&mut self, payload: Option<&str>) -> Result<()> {
        if self.pid.is_some() {
            return Err(DaemonError::DuplicateStart(self.to_string()));
        }

        let raw = payload.unwrap_or_default().trim();
        let pid = raw
            .parse::<u32>()
            .map_err(|_| DaemonError::InvalidPid(raw.to_string()))?;

        self.pid = Some(pid);
        if !self.is_closed() {
            self.state = InstanceState::Started;
        }
        info!("Instance {} started (pid {})", self, pid);

        let plugins = Rc::clone(&self.plugins);
        plugins.run_hooks(HookKind::Init, self);
        plugins.run_hooks(HookKind::After, self);
        Ok(())
    }

    /// Close the connection and run every plugin's cleanup hook. Safe to
    /// call repeatedly; only the first call has any effect.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = InstanceState::Closed;
        info!("Closing instance {}", self);

        if let Some(stream) = self.stream.take() {
            shutdown_stream(stream);
        }
        self.write_buf.clear();

        if let Some(table) = self.table.upgrade() {
            table.borrow_mut().remove(&self.id);
        }

        let plugins = Rc::clone(&self.plugins);
        plugins.run_hooks(HookKind::Cleanup, self);
    }

    /// Append a handler to its event's list.
    pub(crate) fn bind(&mut self, handler: Rc<EventHandler>) {
        self.handlers
            .entry(handler.event().to_string())
            .or_default()
            .push(handler);
    }

    pub(crate) fn insert_export(&mut self, owner: &str, name: &str, export: Export) -> Result<()> {
        if let Some(existing) = self.exports.get(name) {
            if existing.owner != owner {
                return Err(DaemonError::ExportConflict {
                    name: name.to_string(),
                    owner: existing.owner.clone(),
                });
            }
        }

        debug!("{} exported {} on {}", owner, name, self);
        self.exports.insert(
            name.to_string(),
            ExportEntry {
                owner: owner.to_string(),
                export,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.get(name).map(|entry| &entry.export)
    }

    /// Plugin that owns the export `name`.
    #[must_use]
    pub fn export_owner(&self, name: &str) -> Option<&str> {
        self.exports.get(name).map(|entry| entry.owner.as_str())
    }

    /// Shared object exported under `name`, if it has type `T`.
    #[must_use]
    pub fn export_object<T: 'static>(&self, name: &str) -> Option<Rc<T>> {
        self.export(name).and_then(Export::downcast::<T>)
    }

    /// Invoke a function export. `Method` exports receive this instance.
    ///
    /// # Errors
    ///
    /// Fails if the name is not exported or holds data, or with whatever
    /// the function returns.
    pub fn call_export(&mut self, name: &str, args: &[Value]) -> anyhow::Result<Value> {
        let export = self
            .export(name)
            .cloned()
            .ok_or_else(|| DaemonError::ExportNotFound(name.to_string()))?;

        match export {
            Export::Function(func) => func(args),
            Export::Method(method) => method(self, args),
            Export::Value(_) | Export::Object(_) => {
                Err(DaemonError::NotCallable(name.to_string()).into())
            }
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}{}", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("pending", &self.write_buf.len())
            .finish_non_exhaustive()
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn shutdown_stream(stream: Rc<UnixStream>) {
    let Ok(stream) = Rc::try_unwrap(stream) else {
        trace!("Socket still referenced, dropping without shutdown");
        return;
    };
    match stream.into_std() {
        Ok(std_stream) => {
            if let Err(e) = std_stream.shutdown(Shutdown::Both) {
                debug!("Socket shutdown failed: {}", e);
            }
        }
        Err(e) => debug!("Socket deregistration failed: {}", e),
    }
}
