// Copyright 2020 Ant Group. All rights reserved.
// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
//
// SPDX-License-Identifier: (Apache-2.0 AND BSD-3-Clause)

//! A single supervised FS daemon.
//!
//! Every daemon is driven by one event-loop thread owning a state machine;
//! all transitions funnel through it. External callers never touch the
//! machine directly: they enqueue an event and block for its result, or
//! they block on `wait_until_state`. Helper threads (the child waiter and
//! the readiness poller) feed events the same way, so attach/detach from
//! the snapshotter path never has to wait for daemon I/O.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rust_fsm::*;

use snapshotter_api::client::DaemonClient;
use snapshotter_api::error::{Error, Result};
use snapshotter_api::types::{DaemonMode, DaemonRecord, DaemonState, FsDriver, RecoverPolicy};

state_machine! {
    derive(Debug, Clone)
    pub DaemonLifecycle(Init)

    Init => {
        Start => Starting [Spawn],
    },
    Starting => {
        Online => Ready,
        Stop => Stopping [Terminate],
        Exited => Dead [Reap],
    },
    Ready => {
        Attach => Running,
        Stop => Stopping [Terminate],
        Exited => Dead [Reap],
    },
    Running => {
        Detach => Ready,
        Stop => Stopping [Terminate],
        Exited => Dead [Reap],
    },
    Stopping => {
        Exited => Dead [Reap],
    },
    Dead => {
        Start => Starting [Respawn],
    },
}

pub type Trigger = Sender<DaemonLifecycleInput>;

/// Settings shared by every daemon the supervisor creates.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub binary: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub wait_timeout: Duration,
    /// Time allowed for a freshly spawned process to reach READY.
    pub startup_timeout: Duration,
    pub recover_policy: RecoverPolicy,
}

pub struct Daemon {
    pub id: String,
    pub mode: DaemonMode,
    pub fs_driver: FsDriver,
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
    /// Bootstrap served by a dedicated daemon, none for shared ones.
    pub bootstrap: Option<PathBuf>,
    opts: DaemonOptions,

    api_socket: Mutex<PathBuf>,
    client: Mutex<Arc<DaemonClient>>,
    state: Mutex<DaemonState>,
    state_cond: Condvar,
    ref_count: AtomicI32,
    pid: AtomicI32,
    stopping: AtomicBool,
    taking_over: AtomicBool,
    channel: Mutex<Option<(Trigger, Receiver<Result<()>>)>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        mode: DaemonMode,
        fs_driver: FsDriver,
        mountpoint: PathBuf,
        config_path: PathBuf,
        api_socket: PathBuf,
        bootstrap: Option<PathBuf>,
        opts: DaemonOptions,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(DaemonClient::new(&api_socket, opts.wait_timeout)?);
        let (trigger, events) = channel();
        let (result_tx, result_rx) = channel();

        let daemon = Arc::new(Daemon {
            id,
            mode,
            fs_driver,
            mountpoint,
            config_path,
            bootstrap,
            opts,
            api_socket: Mutex::new(api_socket),
            client: Mutex::new(client),
            state: Mutex::new(DaemonState::Init),
            state_cond: Condvar::new(),
            ref_count: AtomicI32::new(0),
            pid: AtomicI32::new(0),
            stopping: AtomicBool::new(false),
            taking_over: AtomicBool::new(false),
            channel: Mutex::new(Some((trigger, result_rx))),
            threads: Mutex::new(Vec::new()),
        });

        let ctx = DaemonContext {
            sm: StateMachine::new(),
            daemon: daemon.clone(),
            events,
            result_tx,
        };
        let handle = ctx.kick_state_machine()?;
        daemon.threads.lock().unwrap().push(handle);

        Ok(daemon)
    }

    /// Rebuild a daemon object around an already-running process found
    /// during recovery.
    pub fn recovered(record: &DaemonRecord, state: DaemonState, opts: DaemonOptions) -> Result<Arc<Self>> {
        let daemon = Daemon::new(
            record.id.clone(),
            record.mode,
            record.fs_driver,
            record.mountpoint.clone(),
            record.config_path.clone(),
            record.api_socket.clone(),
            None,
            opts,
        )?;
        daemon.pid.store(record.pid, Ordering::Release);
        daemon.set_state(state);
        // The event loop starts from Init; fast-forward it to the observed
        // state so later events make sense.
        {
            let mut threads = daemon.threads.lock().unwrap();
            let stale = threads.remove(0);
            drop(threads);
            // Replace the loop with one seeded from the live state.
            let (trigger, events) = channel();
            let (result_tx, result_rx) = channel();
            let fsm_state = match state {
                DaemonState::Running => DaemonLifecycleState::Running,
                _ => DaemonLifecycleState::Ready,
            };
            let old = daemon
                .channel
                .lock()
                .unwrap()
                .replace((trigger, result_rx));
            drop(old);
            stale.join().map_err(|_| Error::internal("join stale event loop"))?;
            let ctx = DaemonContext {
                sm: StateMachine::from_state(fsm_state),
                daemon: daemon.clone(),
                events,
                result_tx,
            };
            let handle = ctx.kick_state_machine()?;
            daemon.threads.lock().unwrap().push(handle);
        }
        daemon.spawn_pid_monitor();
        Ok(daemon)
    }

    pub fn api_socket(&self) -> PathBuf {
        self.api_socket.lock().unwrap().clone()
    }

    pub fn client(&self) -> Arc<DaemonClient> {
        self.client.lock().unwrap().clone()
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: DaemonState) {
        *self.state.lock().unwrap() = s;
        self.state_cond.notify_all();
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Increment the instance reference count, returning the prior value.
    pub fn inc_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrement the instance reference count, returning the new value.
    pub fn dec_ref(&self) -> i32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "daemon {} reference count underflow", self.id);
        prev - 1
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn is_taking_over(&self) -> bool {
        self.taking_over.load(Ordering::Acquire)
    }

    pub fn begin_takeover(&self) {
        self.taking_over.store(true, Ordering::Release);
    }

    pub fn end_takeover(&self) {
        self.taking_over.store(false, Ordering::Release);
    }

    /// Enqueue a lifecycle event and wait for the event loop's verdict.
    pub fn on_event(&self, event: DaemonLifecycleInput) -> Result<()> {
        let guard = self.channel.lock().unwrap();
        let (trigger, result_rx) = guard
            .as_ref()
            .ok_or_else(|| Error::internal(format!("daemon {} is disconnected", self.id)))?;
        trigger
            .send(event)
            .map_err(|e| Error::internal(format!("daemon {} event loop gone: {}", self.id, e)))?;
        result_rx
            .recv()
            .map_err(|e| Error::internal(format!("daemon {} event loop gone: {}", self.id, e)))?
    }

    /// Kick the initial spawn.
    pub fn start(&self) -> Result<()> {
        self.on_event(DaemonLifecycleInput::Start)
    }

    /// Block until the daemon reaches `want`, the deadline passes, or the
    /// daemon dies.
    pub fn wait_until_state(&self, want: DaemonState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if *state == want {
                return Ok(());
            }
            if *state == DaemonState::Dead && want != DaemonState::Dead {
                return Err(Error::failed_precondition(format!(
                    "daemon {} is dead",
                    self.id
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::unavailable(format!(
                    "daemon {} still {} after {:?}",
                    self.id, *state, timeout
                )));
            }
            let (guard, _) = self
                .state_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Block until the daemon can serve mounts.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                DaemonState::Ready | DaemonState::Running => return Ok(()),
                DaemonState::Dead => {
                    return Err(Error::failed_precondition(format!(
                        "daemon {} is dead",
                        self.id
                    )))
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::unavailable(format!(
                    "daemon {} not ready after {:?}",
                    self.id, timeout
                )));
            }
            let (guard, _) = self
                .state_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Build the daemon command line around `binary` and `api_socket`.
    pub fn build_command(&self, binary: &Path, api_socket: &Path, upgrade: bool) -> Command {
        let mut cmd = Command::new(binary);
        match self.fs_driver {
            FsDriver::Fusedev => {
                cmd.arg("--mountpoint").arg(&self.mountpoint);
                if let Some(bootstrap) = &self.bootstrap {
                    cmd.arg("--bootstrap").arg(bootstrap);
                }
            }
            FsDriver::Fscache => {
                cmd.arg("singleton").arg("--fscache").arg(&self.mountpoint);
            }
        }
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("--apisock")
            .arg(api_socket)
            .arg("--id")
            .arg(&self.id)
            .arg("--log-level")
            .arg(&self.opts.log_level)
            .arg("--log-file")
            .arg(self.opts.log_dir.join(format!("{}.log", self.id)));
        if upgrade {
            cmd.arg("--upgrade");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn launch(self: &Arc<Self>, takeover: bool) -> Result<()> {
        let sock = self.api_socket();
        if let Some(dir) = sock.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::create_dir_all(&self.mountpoint)?;
        fs::create_dir_all(&self.opts.log_dir)?;

        let binary = self.opts.binary.clone();
        let mut cmd = self.build_command(&binary, &sock, takeover);
        let child = cmd
            .spawn()
            .map_err(|e| Error::internal(format!("spawn {}: {}", self.opts.binary.display(), e)))?;
        let pid = child.id() as i32;
        self.pid.store(pid, Ordering::Release);
        info!("daemon {} spawned with pid {}", self.id, pid);

        self.spawn_waiter(child);
        let daemon = self.clone();
        let poller = thread::Builder::new()
            .name(format!("poll-{}", self.id))
            .spawn(move || daemon.poll_ready(takeover))
            .map_err(|e| Error::internal(format!("spawn readiness poller: {}", e)))?;
        self.threads.lock().unwrap().push(poller);
        Ok(())
    }

    /// Park a thread on the child handle so process exit turns into an
    /// `Exited` event, followed by the configured death policy.
    pub fn spawn_waiter(self: &Arc<Self>, mut child: Child) {
        let daemon = self.clone();
        let handle = thread::Builder::new()
            .name(format!("wait-{}", self.id))
            .spawn(move || {
                let pid = child.id();
                let status = child.wait();
                if daemon.is_taking_over() {
                    info!("daemon {} pid {} left for its successor", daemon.id, pid);
                    return;
                }
                warn!(
                    "daemon {} pid {} exited with {:?}",
                    daemon.id, pid, status
                );
                let _ = daemon.on_event(DaemonLifecycleInput::Exited);
                daemon.apply_death_policy();
            })
            .expect("spawn daemon waiter");
        self.threads.lock().unwrap().push(handle);
    }

    /// For adopted processes that are not our children: watch the pid.
    fn spawn_pid_monitor(self: &Arc<Self>) {
        let daemon = self.clone();
        let handle = thread::Builder::new()
            .name(format!("watch-{}", self.id))
            .spawn(move || loop {
                if daemon.is_stopping() || daemon.is_taking_over() {
                    return;
                }
                let pid = daemon.pid();
                if pid <= 0 {
                    return;
                }
                if let Err(Errno::ESRCH) = kill(Pid::from_raw(pid), None::<Signal>) {
                    warn!("daemon {} pid {} is gone", daemon.id, pid);
                    let _ = daemon.on_event(DaemonLifecycleInput::Exited);
                    daemon.apply_death_policy();
                    return;
                }
                thread::sleep(Duration::from_secs(1));
            })
            .expect("spawn daemon pid monitor");
        self.threads.lock().unwrap().push(handle);
    }

    fn apply_death_policy(&self) {
        if self.is_stopping() {
            return;
        }
        match self.opts.recover_policy {
            RecoverPolicy::Restart => {
                warn!("daemon {} died unexpectedly, restarting", self.id);
                if let Err(e) = self.on_event(DaemonLifecycleInput::Start) {
                    error!("daemon {} restart failed: {}", self.id, e);
                }
            }
            RecoverPolicy::Failover => {
                error!(
                    "daemon {} died, failover policy leaves it dead; its mounts will fail",
                    self.id
                );
            }
            RecoverPolicy::None => {
                warn!("daemon {} died, recover policy is none", self.id);
            }
        }
    }

    fn poll_ready(&self, takeover: bool) {
        let deadline = Instant::now() + self.opts.startup_timeout;
        let mut adopted = false;
        loop {
            if self.is_stopping() || self.state() == DaemonState::Dead {
                return;
            }
            if Instant::now() >= deadline {
                error!(
                    "daemon {} did not come up within {:?}",
                    self.id, self.opts.startup_timeout
                );
                return;
            }
            let client = self.client();
            if let Ok(info) = client.info() {
                match info.state() {
                    DaemonState::Init if takeover && !adopted => {
                        // Fresh upgrade-mode process: hand it the previous
                        // session before it may serve.
                        if let Err(e) = client.takeover().and_then(|_| client.start()) {
                            error!("daemon {} takeover failed: {}", self.id, e);
                            return;
                        }
                        adopted = true;
                    }
                    DaemonState::Ready | DaemonState::Running => {
                        if let Err(e) = self.on_event(DaemonLifecycleInput::Online) {
                            error!("daemon {} online event: {}", self.id, e);
                        }
                        return;
                    }
                    _ => {}
                }
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn terminate(&self) -> Result<()> {
        let pid = self.pid();
        if pid > 0 {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(Error::internal(format!(
                        "terminate daemon {} pid {}: {}",
                        self.id, pid, e
                    )))
                }
            }
        }
        Ok(())
    }

    fn on_exit(&self) {
        self.pid.store(0, Ordering::Release);
    }

    /// Stop the daemon process and reap every helper thread. Escalates to
    /// SIGKILL when SIGTERM does not bite within the timeout.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.stopping.store(true, Ordering::Release);

        let state = self.state();
        if state != DaemonState::Init && state != DaemonState::Dead {
            if let Err(e) = self.on_event(DaemonLifecycleInput::Stop) {
                // The process may have died between the state check and the
                // event; anything else is a real failure.
                if self.state() != DaemonState::Dead {
                    return Err(e);
                }
            }
            if self.state() != DaemonState::Dead
                && self.wait_until_state(DaemonState::Dead, timeout).is_err()
            {
                let pid = self.pid();
                warn!("daemon {} ignored SIGTERM, sending SIGKILL", self.id);
                if pid > 0 {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                }
                self.wait_until_state(DaemonState::Dead, timeout)?;
            }
        }

        self.disconnect();
        self.join_threads();
        Ok(())
    }

    /// Drop the event channel so the event loop unblocks and exits.
    pub fn disconnect(&self) {
        self.channel.lock().unwrap().take();
    }

    fn join_threads(&self) {
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Swap in the successor process created by a rolling upgrade.
    pub fn adopt(self: &Arc<Self>, api_socket: PathBuf, child: Child) -> Result<()> {
        let client = Arc::new(DaemonClient::new(&api_socket, self.opts.wait_timeout)?);
        *self.api_socket.lock().unwrap() = api_socket;
        *self.client.lock().unwrap() = client;
        self.pid.store(child.id() as i32, Ordering::Release);
        self.spawn_waiter(child);
        Ok(())
    }

    pub fn record(&self) -> DaemonRecord {
        DaemonRecord {
            id: self.id.clone(),
            pid: self.pid(),
            api_socket: self.api_socket(),
            fs_driver: self.fs_driver,
            mode: self.mode,
            mountpoint: self.mountpoint.clone(),
            config_path: self.config_path.clone(),
        }
    }
}

struct DaemonContext {
    sm: StateMachine<DaemonLifecycle>,
    daemon: Arc<Daemon>,
    events: Receiver<DaemonLifecycleInput>,
    result_tx: Sender<Result<()>>,
}

impl DaemonContext {
    fn kick_state_machine(mut self) -> Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("sm-{}", self.daemon.id))
            .spawn(move || loop {
                use DaemonLifecycleOutput::*;

                let event = match self.events.recv() {
                    Ok(e) => e,
                    // All triggers dropped: the daemon was disconnected.
                    Err(_) => break,
                };
                let last = self.sm.state().clone();
                let rollback = StateMachine::<DaemonLifecycle>::from_state(last.clone());
                let action = match self.sm.consume(&event) {
                    Ok(a) => a,
                    Err(_) => {
                        warn!(
                            "daemon {}: event {:?} rejected in state {:?}",
                            self.daemon.id, event, last
                        );
                        let _ = self.result_tx.send(Err(Error::failed_precondition(format!(
                            "daemon {} cannot handle {:?} while {:?}",
                            self.daemon.id, event, last
                        ))));
                        continue;
                    }
                };

                let d = &self.daemon;
                debug!(
                    "daemon {}: {:?} -> {:?} on {:?}",
                    d.id,
                    last,
                    self.sm.state(),
                    event
                );
                let r = match action {
                    Some(Spawn) => d.launch(false),
                    Some(Respawn) => d.launch(true),
                    Some(Terminate) => d.terminate(),
                    Some(Reap) => {
                        d.on_exit();
                        Ok(())
                    }
                    None => Ok(()),
                };

                match &r {
                    Ok(()) => {
                        let state = match self.sm.state() {
                            DaemonLifecycleState::Init => DaemonState::Init,
                            DaemonLifecycleState::Starting => DaemonState::Starting,
                            DaemonLifecycleState::Ready => DaemonState::Ready,
                            DaemonLifecycleState::Running => DaemonState::Running,
                            DaemonLifecycleState::Stopping => DaemonState::Stopping,
                            DaemonLifecycleState::Dead => DaemonState::Dead,
                        };
                        d.set_state(state);
                    }
                    Err(e) => {
                        error!(
                            "daemon {}: {:?} failed: {}, staying {:?}",
                            d.id,
                            event,
                            e,
                            rollback.state()
                        );
                        self.sm = rollback;
                    }
                }
                let _ = self.result_tx.send(r);

                if matches!(event, DaemonLifecycleInput::Exited) && d.is_stopping() {
                    break;
                }
            })
            .map_err(|e| Error::internal(format!("spawn daemon event loop: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn options(dir: &Path) -> DaemonOptions {
        DaemonOptions {
            // Anything executable that exits immediately works here.
            binary: PathBuf::from("/bin/true"),
            log_dir: dir.join("logs"),
            log_level: "info".to_string(),
            wait_timeout: Duration::from_millis(300),
            startup_timeout: Duration::from_millis(500),
            recover_policy: RecoverPolicy::None,
        }
    }

    fn daemon(dir: &Path, policy: RecoverPolicy) -> Arc<Daemon> {
        let mut opts = options(dir);
        opts.recover_policy = policy;
        Daemon::new(
            "d-test".to_string(),
            DaemonMode::Shared,
            FsDriver::Fusedev,
            dir.join("mnt"),
            dir.join("config.json"),
            dir.join("socket").join("d-test").join("api0.sock"),
            None,
            opts,
        )
        .unwrap()
    }

    #[test]
    fn test_initial_state_and_bad_event() {
        let dir = TempDir::new().unwrap();
        let d = daemon(dir.as_path(), RecoverPolicy::None);
        assert_eq!(d.state(), DaemonState::Init);
        // Attach before start is a state machine violation.
        let err = d.on_event(DaemonLifecycleInput::Attach).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        d.stop(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn test_spawn_exit_reaches_dead() {
        let dir = TempDir::new().unwrap();
        let d = daemon(dir.as_path(), RecoverPolicy::None);
        d.start().unwrap();
        // /bin/true exits at once and no API socket ever answers, so the
        // waiter drives the daemon to Dead.
        d.wait_until_state(DaemonState::Dead, Duration::from_secs(5))
            .unwrap();
        assert_eq!(d.pid(), 0);
        d.stop(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn test_wait_ready_fails_fast_when_dead() {
        let dir = TempDir::new().unwrap();
        let d = daemon(dir.as_path(), RecoverPolicy::Failover);
        d.start().unwrap();
        d.wait_until_state(DaemonState::Dead, Duration::from_secs(5))
            .unwrap();
        let err = d.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
        d.stop(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn test_ref_counting() {
        let dir = TempDir::new().unwrap();
        let d = daemon(dir.as_path(), RecoverPolicy::None);
        assert_eq!(d.inc_ref(), 0);
        assert_eq!(d.inc_ref(), 1);
        assert_eq!(d.dec_ref(), 1);
        assert_eq!(d.dec_ref(), 0);
        d.stop(Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn test_command_line_shape() {
        let dir = TempDir::new().unwrap();
        let d = daemon(dir.as_path(), RecoverPolicy::None);
        let cmd = d.build_command(Path::new("/usr/bin/nydusd"), Path::new("/tmp/api1.sock"), true);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--mountpoint".to_string()));
        assert!(args.contains(&"--apisock".to_string()));
        assert!(args.contains(&"/tmp/api1.sock".to_string()));
        assert!(args.contains(&"--upgrade".to_string()));
        d.stop(Duration::from_millis(200)).unwrap();
    }
}
