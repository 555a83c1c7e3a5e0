//! Monitor engine
//!
//! Process-wide registry of polling monitors (periodic blocking requests)
//! and pattern monitors (asynchronous notification matching). One thread
//! services the polling list; each async-capable backend with registered
//! pattern monitors gets its own receiver thread.
//!
//! Callbacks run with no registry lock held, so a callback may freely issue
//! further requests; it must not block waiting for another callback on the
//! same backend, which would deadlock the servicing thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::core::backend::{Backend, RequestArg};
use crate::core::data_item::DataItem;
use crate::utils::error::{ApSrvError, Result};

/// Callback for polling monitors. The result is `None` when the periodic
/// request failed; the data item is owned by the engine and must not be
/// retained beyond the call.
pub type PollingCallback = dyn Fn(&Arc<dyn Backend>, Option<&DataItem>) + Send + Sync;

/// Callback for pattern monitors. Receives the full result tree of the
/// notification that matched, owned by the engine for the duration of the
/// call.
pub type PatternCallback = dyn Fn(&Arc<dyn Backend>, &DataItem) + Send + Sync;

struct PollingMonitor {
    backend: Arc<dyn Backend>,
    command: Arc<DataItem>,
    callback: Arc<PollingCallback>,
    period: Duration,
    next_time: Instant,
}

struct PatternMonitor {
    backend: Arc<dyn Backend>,
    command: Arc<DataItem>,
    callback: Arc<PatternCallback>,
    /// Stored for diagnostics; matching keys off the first request-tree key.
    #[allow(dead_code)]
    pattern: String,
}

/// Pattern monitors grouped per backend, serviced by one receiver thread.
struct AsyncGroup {
    backend: Arc<dyn Backend>,
    monitors: Mutex<Vec<Arc<PatternMonitor>>>,
}

#[derive(Default)]
struct PollingState {
    monitors: Vec<PollingMonitor>,
}

#[derive(Default)]
struct GroupState {
    groups: Vec<Arc<AsyncGroup>>,
    started: bool,
}

struct EngineShared {
    polling: Mutex<PollingState>,
    polling_cond: Condvar,
    groups: Mutex<GroupState>,
    running: AtomicBool,
}

/// The monitor engine. Construct once, register monitors, `start`, and
/// `stop` at shutdown.
pub struct MonitorEngine {
    shared: Arc<EngineShared>,
    polling_thread: Mutex<Option<JoinHandle<()>>>,
    async_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for MonitorEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorEngine {
    pub fn new() -> MonitorEngine {
        MonitorEngine {
            shared: Arc::new(EngineShared {
                polling: Mutex::new(PollingState::default()),
                polling_cond: Condvar::new(),
                groups: Mutex::new(GroupState::default()),
                running: AtomicBool::new(false),
            }),
            polling_thread: Mutex::new(None),
            async_threads: Mutex::new(Vec::new()),
        }
    }

    /// Registers a polling monitor: `args` are marshalled once through the
    /// backend's argument processor and the resulting request is sent every
    /// `period_ms`, with the response delivered to `callback`. The first
    /// request fires as soon as the polling thread sees the monitor.
    pub fn monitor_polling(
        &self,
        backend: Arc<dyn Backend>,
        period_ms: u32,
        callback: Arc<PollingCallback>,
        args: &[RequestArg<'_>],
    ) -> Result<()> {
        let command = backend.process_request_args(args)?;

        let mut state = self.shared.polling.lock();
        state.monitors.push(PollingMonitor {
            backend,
            command: Arc::new(command),
            callback,
            period: Duration::from_millis(u64::from(period_ms)),
            next_time: Instant::now(),
        });
        self.shared.polling_cond.notify_all();
        Ok(())
    }

    /// Registers a pattern monitor on an async-capable backend. Incoming
    /// notifications whose top-level keys contain the first key of the
    /// monitor's request tree are delivered to `callback`.
    ///
    /// The pattern string is stored but not consulted for matching.
    /// Registration is only permitted before the engine is started: the
    /// receiver threads are spawned by `start`.
    pub fn monitor_pattern(
        &self,
        backend: Arc<dyn Backend>,
        pattern: &str,
        callback: Arc<PatternCallback>,
        args: &[RequestArg<'_>],
    ) -> Result<()> {
        if !backend.supports_async() {
            return Err(ApSrvError::NotSupported(format!(
                "{}: pattern monitoring",
                backend.name()
            )));
        }

        let command = backend.process_request_args(args)?;

        let mut state = self.shared.groups.lock();
        if state.started {
            return Err(ApSrvError::State(
                "pattern monitors cannot be registered after start".to_string(),
            ));
        }

        let group = match state
            .groups
            .iter()
            .find(|g| Arc::ptr_eq(&g.backend, &backend))
        {
            Some(group) => group.clone(),
            None => {
                let group = Arc::new(AsyncGroup {
                    backend: backend.clone(),
                    monitors: Mutex::new(Vec::new()),
                });
                state.groups.push(group.clone());
                group
            },
        };

        group.monitors.lock().push(Arc::new(PatternMonitor {
            backend,
            command: Arc::new(command),
            callback,
            pattern: pattern.to_string(),
        }));
        Ok(())
    }

    /// Spawns the polling thread and one receiver thread per async group.
    pub fn start(&self) -> Result<()> {
        let polling = self.shared.polling.lock();
        let mut groups = self.shared.groups.lock();

        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ApSrvError::State("engine already running".to_string()));
        }
        groups.started = true;
        drop(polling);

        let shared = self.shared.clone();
        *self.polling_thread.lock() = Some(std::thread::spawn(move || {
            polling_thread_fn(&shared);
        }));

        let mut threads = self.async_threads.lock();
        for group in &groups.groups {
            let shared = self.shared.clone();
            let group = group.clone();
            threads.push(std::thread::spawn(move || {
                async_thread_fn(&shared, &group);
            }));
        }

        info!("Monitor engine started ({} async groups)", groups.groups.len());
        Ok(())
    }

    /// Stops and joins every engine thread.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(ApSrvError::State("engine not running".to_string()));
        }
        self.shared.polling_cond.notify_all();

        if let Some(handle) = self.polling_thread.lock().take() {
            let _ = handle.join();
        }
        for handle in self.async_threads.lock().drain(..) {
            let _ = handle.join();
        }

        info!("Monitor engine stopped");
        Ok(())
    }
}

impl Drop for MonitorEngine {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}

/// Performs one monitor request, swallowing errors into a `None` result.
fn internal_request(backend: &Arc<dyn Backend>, command: &DataItem) -> Option<DataItem> {
    if !backend.supports_blocking() {
        return None;
    }
    match backend.req_blocking(command) {
        Ok(result) => Some(result),
        Err(e) => {
            error!("req_blocking failed: {}", e);
            None
        },
    }
}

/// The polling thread.
///
/// Scans the monitor list for an overdue monitor; if one is found its
/// request runs and its callback fires with the registry lock released,
/// then the scan restarts. At most one monitor fires per pass. With nothing
/// overdue the thread sleeps until the earliest deadline or, with an empty
/// list, until a registration signals the condvar.
fn polling_thread_fn(shared: &Arc<EngineShared>) {
    let mut state = shared.polling.lock();

    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut due = None;

        for (idx, monitor) in state.monitors.iter().enumerate() {
            if earliest.map_or(true, |e| monitor.next_time < e) {
                earliest = Some(monitor.next_time);
            }
            if monitor.next_time < now {
                due = Some(idx);
                break;
            }
        }

        if let Some(idx) = due {
            let monitor = &mut state.monitors[idx];
            monitor.next_time = now + monitor.period;

            let backend = monitor.backend.clone();
            let command = monitor.command.clone();
            let callback = monitor.callback.clone();

            MutexGuard::unlocked(&mut state, || {
                let result = internal_request(&backend, &command);
                callback(&backend, result.as_ref());
            });
            continue;
        }

        match earliest {
            Some(deadline) => {
                let _ = shared.polling_cond.wait_until(&mut state, deadline);
            },
            None => shared.polling_cond.wait(&mut state),
        }
    }
}

/// A per-group receiver thread.
///
/// Runs one bounded async receive per iteration; each produced result tree
/// is matched against every monitor in the group by looking the monitor's
/// first request-tree key up among the result's top-level siblings, and
/// matching callbacks receive the full tree. Dispatch happens on a snapshot
/// taken under the group lock, with the lock released while callbacks run.
fn async_thread_fn(shared: &Arc<EngineShared>, group: &Arc<AsyncGroup>) {
    while shared.running.load(Ordering::SeqCst) {
        if group.monitors.lock().is_empty() {
            break;
        }

        let mut result: Option<DataItem> = None;
        if let Err(e) = group.backend.req_async(&mut result) {
            // Never surfaced; avoid a hot loop when the backend cannot
            // even set its socket up.
            debug!("{}: req_async failed: {}", group.backend.name(), e);
            std::thread::sleep(Duration::from_secs(1));
            continue;
        }

        let Some(result) = result else {
            continue;
        };

        let snapshot: Vec<_> = group.monitors.lock().iter().cloned().collect();
        for monitor in snapshot {
            let Some(key) = monitor.command.key.as_ref() else {
                continue;
            };
            if result.find_key(key).is_some() {
                (monitor.callback)(&monitor.backend, &result);
            }
        }
    }
}
