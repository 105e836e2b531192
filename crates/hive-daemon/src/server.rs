//! Socket server for the hive daemon.
//!
//! One listening Unix socket, one thread. Every iteration waits (bounded by
//! the poll interval) for a new connection, readiness on any live instance,
//! or a termination signal, then services whatever became ready. Instances
//! are only ever touched from this loop, so all shared state is `Rc`/`RefCell`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::rc::Rc;

use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::io::{Interest, Ready};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, trace, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::instance::{ConnectionTable, Instance, InstanceId};
use crate::pidfile;
use crate::plugin::PluginSet;
use crate::plugins::PluginCatalog;

/// What woke the loop.
enum Wake {
    Accept(io::Result<UnixStream>),
    Ready(Vec<(InstanceId, io::Result<Ready>)>),
    Signal(&'static str),
    Timeout,
}

pub struct Daemon {
    config: DaemonConfig,
    listener: Option<UnixListener>,
    plugins: Rc<PluginSet>,
    instances: Rc<RefCell<ConnectionTable>>,
    next_id: u64,
    ever_accepted: bool,
    shutdown_requested: bool,
    pid_written: bool,
}

impl Daemon {
    /// Claim the socket path and write the PID file.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::AlreadyRunning`] if another daemon answers on
    /// the socket path and [`DaemonError::Bind`] if the socket cannot be
    /// bound. A PID file that cannot be written is only logged.
    pub async fn bind(config: DaemonConfig, plugins: PluginSet) -> Result<Self> {
        let path = config.socket_path.clone();
        cleanup_stale_socket(&path).await?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let listener = UnixListener::bind(&path).map_err(|source| DaemonError::Bind {
            path: path.clone(),
            source,
        })?;
        if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o600)) {
            warn!("Failed to restrict socket permissions: {}", e);
        }
        info!("Daemon listening on {}", path.display());

        let pid_written = match &config.pid_file {
            Some(pid_file) => match pidfile::write(pid_file) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Continuing without PID file: {}", e);
                    false
                }
            },
            None => false,
        };

        Ok(Self {
            config,
            listener: Some(listener),
            plugins: Rc::new(plugins),
            instances: Rc::new(RefCell::new(BTreeMap::new())),
            next_id: 0,
            ever_accepted: false,
            shutdown_requested: false,
            pid_written,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    #[must_use]
    pub fn plugins(&self) -> &Rc<PluginSet> {
        &self.plugins
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.borrow().len()
    }

    /// Live instance by id.
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<Rc<RefCell<Instance>>> {
        self.instances.borrow().get(&id).cloned()
    }

    /// Ask the loop to stop at the end of the current iteration.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Serve until a termination signal arrives or, with auto-close, the
    /// last instance leaves. Shuts down before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handlers cannot be installed.
    pub async fn run(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        info!("Ready to accept connections");
        while !self.should_stop() {
            let wake = {
                let Some(listener) = self.listener.as_ref() else {
                    break;
                };
                let mut waits: FuturesUnordered<_> = self
                    .readiness_snapshot()
                    .into_iter()
                    .map(|(id, stream, interest)| async move {
                        (id, stream.ready(interest).await)
                    })
                    .collect();
                tokio::select! {
                    accepted = listener.accept() => {
                        Wake::Accept(accepted.map(|(stream, _)| stream))
                    }
                    Some(first) = waits.next(), if !waits.is_empty() => {
                        let mut ready = vec![first];
                        while let Some(Some(more)) = waits.next().now_or_never() {
                            ready.push(more);
                        }
                        Wake::Ready(ready)
                    }
                    _ = sigterm.recv() => Wake::Signal("SIGTERM"),
                    _ = sigint.recv() => Wake::Signal("SIGINT"),
                    () = tokio::time::sleep(self.config.poll_interval()) => Wake::Timeout,
                }
            };

            match wake {
                Wake::Accept(Ok(stream)) => self.register(stream),
                Wake::Accept(Err(e)) => error!("Accept error: {}", e),
                Wake::Ready(ready) => self.service(ready),
                Wake::Signal(name) => {
                    info!("Received {}, shutting down", name);
                    self.shutdown_requested = true;
                }
                Wake::Timeout => trace!("Poll interval elapsed"),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn should_stop(&self) -> bool {
        if self.shutdown_requested {
            return true;
        }
        if self.config.auto_close && self.ever_accepted && self.instances.borrow().is_empty() {
            info!("Last instance disconnected, auto-closing");
            return true;
        }
        false
    }

    /// Socket handle and interest of every live instance. The handles are
    /// owned so no instance stays borrowed while the loop waits.
    fn readiness_snapshot(&self) -> Vec<(InstanceId, Rc<UnixStream>, Interest)> {
        self.instances
            .borrow()
            .iter()
            .filter_map(|(id, instance)| {
                let instance = instance.borrow();
                let stream = Rc::clone(instance.stream()?);
                Some((*id, stream, instance.interest()))
            })
            .collect()
    }

    fn register(&mut self, stream: UnixStream) {
        self.next_id += 1;
        let id = InstanceId::from(self.next_id);
        let instance = Instance::new(id, stream, Rc::clone(&self.plugins))
            .with_table(Rc::downgrade(&self.instances))
            .with_print_events(self.config.print_events);

        self.instances
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(instance)));
        self.ever_accepted = true;
        info!("Accepted connection {}", id);
    }

    fn service(&mut self, ready: Vec<(InstanceId, io::Result<Ready>)>) {
        for (id, readiness) in ready {
            let Some(instance) = self.instance(id) else {
                continue;
            };
            let mut instance = instance.borrow_mut();

            let readiness = match readiness {
                Ok(readiness) => readiness,
                Err(e) => {
                    debug!("Readiness error on {}: {}", instance, e);
                    instance.close();
                    continue;
                }
            };

            if readiness.is_error() {
                debug!("Socket error on {}", instance);
                instance.close();
                continue;
            }
            if readiness.is_writable() {
                instance.flush();
            }
            if readiness.is_readable() && !instance.is_closed() {
                instance.feed();
            }
        }
    }

    /// Stop listening, close every instance, remove the PID file. Only the
    /// first call does anything.
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            drop(listener);
            let path = &self.config.socket_path;
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket file {}: {}", path.display(), e),
            }
        }

        let live: Vec<_> = self.instances.borrow().values().cloned().collect();
        if !live.is_empty() {
            info!("Closing {} remaining instances", live.len());
        }
        for instance in live {
            instance.borrow_mut().close();
        }

        if self.pid_written {
            if let Some(pid_file) = &self.config.pid_file {
                pidfile::remove(pid_file);
            }
            self.pid_written = false;
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Load the configured plugins, bind, and serve until shutdown.
///
/// # Errors
///
/// Fails on an unknown or invalid plugin, a live daemon on the socket path,
/// or a bind failure.
pub async fn run(config: DaemonConfig, catalog: &PluginCatalog) -> Result<()> {
    let plugins = catalog.load(config.plugins.as_slice())?;
    info!(
        "Loaded plugins: {}",
        plugins.names().collect::<Vec<_>>().join(", ")
    );

    let mut daemon = Daemon::bind(config, plugins).await?;
    daemon.run().await
}

/// Whether a daemon accepts connections on `path`.
pub async fn is_listening(path: &Path) -> bool {
    UnixStream::connect(path).await.is_ok()
}

async fn cleanup_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if is_listening(path).await {
            return Err(DaemonError::AlreadyRunning(path.to_path_buf()));
        }
        info!("Removing stale socket at {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(())
}
