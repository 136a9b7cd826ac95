// SPDX-License-Identifier: GPL-2.0

//! # The perflock daemon
//!
//! One listener thread accepts connections; each connection gets a
//! session thread. A session owns at most one queue entry, the saved
//! governor state of the host, and the connection itself. Everything a
//! session owns is released from its `Drop`, so cleanup runs on every
//! exit path: clean EOF, protocol violation, I/O error or panic.
//!
//! Within a session, a reader thread decodes frames and forwards them
//! on a channel while the session selects between that channel and the
//! grant channel. That split is what lets the session notice a client
//! hanging up while it is still parked in the lock queue.

use std::fmt;
use std::fs;
use std::io;
use std::io::BufReader;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::SocketAddr;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use chrono::Local;
use crossbeam::channel::unbounded;
use crossbeam::channel::Select;
use log::debug;
use log::info;
use log::warn;
use serde::Serialize;

use perflock_proto as proto;
use perflock_proto::AcquireResponse;
use perflock_proto::Request;
use perflock_proto::Response;

use perflock_utils::cpufreq;
use perflock_utils::cpufreq::Domain;
use perflock_utils::cpuset_of_pid;
use perflock_utils::Cpumask;

use crate::lock::LockHandle;
use crate::lock::LockQueue;

/// Start the daemon on `path`. The core pool is the set of CPUs init is
/// allowed on, captured once; CPU hotplug after startup is not tracked.
pub fn run(path: &str) -> Result<()> {
    let all_cores = cpuset_of_pid(1).context("reading the allowed CPUs of pid 1")?;
    serve(path, all_cores)
}

/// Accept loop over an explicit core pool.
pub fn serve(path: &str, all_cores: Cpumask) -> Result<()> {
    let lock = Arc::new(LockQueue::new(all_cores.clone()));
    let listener = bind(path)?;
    info!("listening on {} ({} cores)", path, all_cores.weight());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let lock = lock.clone();
                let all_cores = all_cores.clone();
                thread::spawn(move || match Session::new(stream, lock, all_cores) {
                    Ok(session) => {
                        if let Err(e) = session.serve() {
                            warn!("session failed: {:#}", e);
                        }
                    }
                    Err(e) => warn!("rejecting connection: {:#}", e),
                });
            }
            Err(e) => warn!("accept failed: {}", e),
        }
    }

    Ok(())
}

fn bind(path: &str) -> Result<UnixListener> {
    if let Some(name) = path.strip_prefix('@') {
        // Abstract namespace: no filesystem entry, world-connectable,
        // vanishes with the daemon. See unix(7).
        let addr = SocketAddr::from_abstract_name(name)?;
        return UnixListener::bind_addr(&addr)
            .with_context(|| format!("binding abstract socket {}", path));
    }

    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing stale socket {}", path)),
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("binding socket {}", path))?;
    // Every local user may take the lock.
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
        .with_context(|| format!("setting permissions on {}", path))?;
    Ok(listener)
}

fn peer_uid(stream: &UnixStream) -> Result<u32> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("SO_PEERCRED");
    }
    Ok(cred.uid)
}

fn user_name(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => "???".to_string(),
    }
}

struct GovernorSetting {
    domain: Domain,
    min: usize,
    max: usize,
}

struct Session {
    stream: UnixStream,
    lock: Arc<LockQueue>,
    all_cores: Cpumask,
    user_name: String,
    locker: Option<LockHandle>,
    acquiring: bool,
    old_governors: Option<Vec<GovernorSetting>>,
}

impl Session {
    fn new(stream: UnixStream, lock: Arc<LockQueue>, all_cores: Cpumask) -> Result<Session> {
        let uid = peer_uid(&stream).context("reading peer credentials")?;
        Ok(Session {
            stream,
            lock,
            all_cores,
            user_name: user_name(uid),
            locker: None,
            acquiring: false,
            old_governors: None,
        })
    }

    fn serve(mut self) -> Result<()> {
        let reader = self.stream.try_clone().context("cloning connection")?;
        let (tx, actions) = unbounded();
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            loop {
                match proto::recv_msg::<Request, _>(&mut reader) {
                    Ok(req) => {
                        if tx.send(req).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        if !proto::is_disconnect(&e) {
                            warn!("decoding request: {:#}", e);
                        }
                        return;
                    }
                }
            }
        });

        loop {
            // The grant receiver is only armed between enqueue and
            // grant; a session never has more than one pending request.
            let grant = match (&self.locker, self.acquiring) {
                (Some(handle), true) => Some(handle.grant.clone()),
                _ => None,
            };

            let mut sel = Select::new();
            let action_idx = sel.recv(&actions);
            if let Some(grant) = &grant {
                sel.recv(grant);
            }
            let oper = sel.select();

            if oper.index() == action_idx {
                let Ok(req) = oper.recv(&actions) else {
                    // Reader hung up: client EOF or decode failure.
                    return Ok(());
                };
                debug!("<- {:?}", req);
                if self.acquiring {
                    warn!("protocol error: message while acquiring");
                    return Ok(());
                }
                match req {
                    Request::Acquire {
                        pid,
                        cores,
                        shared,
                        non_blocking,
                        msg,
                    } => {
                        if !self.handle_acquire(pid, cores, shared, non_blocking, msg)? {
                            return Ok(());
                        }
                    }
                    Request::List => {
                        let entries = self.lock.queue();
                        self.send(&Response::List(entries))?;
                    }
                    Request::SetGovernor { percent } => {
                        if self.locker.is_none() {
                            warn!("protocol error: setting governor without lock");
                            return Ok(());
                        }
                        let err = match self.set_governor(percent) {
                            Ok(()) => String::new(),
                            Err(e) => format!("{:#}", e),
                        };
                        self.send(&Response::SetGovernor { err })?;
                    }
                }
            } else if let Some(grant) = &grant {
                let Ok(cores) = oper.recv(grant) else {
                    bail!("grant channel closed while acquiring");
                };
                self.acquiring = false;
                self.send(&Response::Acquire(AcquireResponse {
                    acquired: true,
                    cores: cores.to_vec(),
                    err: String::new(),
                }))?;
            }
        }
    }

    /// Returns false when the session must close: protocol violation,
    /// unreadable requester state or a terminal rejection.
    fn handle_acquire(
        &mut self,
        pid: u32,
        cores: usize,
        shared: bool,
        non_blocking: bool,
        msg: String,
    ) -> Result<bool> {
        if self.locker.is_some() {
            warn!("protocol error: acquiring lock twice");
            return Ok(false);
        }

        let avail = match cpuset_of_pid(pid) {
            Ok(avail) => avail,
            Err(e) => {
                warn!("cannot determine the CPU set of pid {}: {:#}", pid, e);
                return Ok(false);
            }
        };
        if cores > avail.weight() {
            let err = format!(
                "requested {} cores, but process only has {} available (system has {})",
                cores,
                avail.weight(),
                self.all_cores.weight()
            );
            self.send(&Response::Acquire(AcquireResponse {
                acquired: false,
                cores: Vec::new(),
                err,
            }))?;
            return Ok(false);
        }

        let mut entry = format!(
            "{}\t{}\t{}\tcores={}",
            self.user_name,
            Local::now().format("%b %e %H:%M:%S"),
            msg,
            cores
        );
        if shared {
            entry.push_str(" [shared]");
        }

        match self.lock.enqueue(shared, non_blocking, cores, avail, entry) {
            Some(handle) => {
                self.locker = Some(handle);
                self.acquiring = true;
            }
            None => {
                // Non-blocking attempt lost the race; not an error.
                self.send(&Response::Acquire(AcquireResponse::default()))?;
            }
        }
        Ok(true)
    }

    fn send<M: Serialize + fmt::Debug>(&self, msg: &M) -> Result<()> {
        debug!("-> {:?}", msg);
        proto::send_msg(&mut &self.stream, msg).context("sending response")
    }

    fn set_governor(&mut self, percent: u32) -> Result<()> {
        let domains = cpufreq::domains()?;
        if domains.is_empty() {
            bail!("no power domains");
        }

        // Capture every domain before touching any, so a mid-apply
        // failure can still be rolled back in full on session exit.
        let old = save_governors(&domains)?;
        self.old_governors = Some(old);

        pin_governors(&domains, percent)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Unblock the reader thread; shutdown reaches the cloned fd.
        let _ = self.stream.shutdown(Shutdown::Both);

        // Restore the governor before releasing the lock, so the next
        // holder never observes this session's frequency settings.
        if let Some(old) = self.old_governors.take() {
            if let Err(e) = restore_governors(&old) {
                warn!("restoring governor: {:#}", e);
            }
        }
        if let Some(handle) = self.locker.take() {
            self.lock.dequeue(handle.id);
        }
    }
}

fn save_governors(domains: &[Domain]) -> Result<Vec<GovernorSetting>> {
    let mut old = Vec::with_capacity(domains.len());
    for domain in domains {
        let (min, max) = domain
            .current_range()
            .with_context(|| format!("reading current range of {}", domain.name()))?;
        old.push(GovernorSetting {
            domain: domain.clone(),
            min,
            max,
        });
    }
    Ok(old)
}

/// Pin each domain to `percent` of its hardware range, snapped to the
/// nearest published frequency where a table exists. Stops at the first
/// failure; partial state is the restore path's job.
fn pin_governors(domains: &[Domain], percent: u32) -> Result<()> {
    for domain in domains {
        let (min, max, avail) = domain
            .available_range()
            .with_context(|| format!("reading available range of {}", domain.name()))?;
        let target = governor_target(min, max, &avail, percent);
        domain
            .set_range(target, target)
            .with_context(|| format!("pinning {} to {} kHz", domain.name(), target))?;
    }
    Ok(())
}

/// Best-effort: every domain is attempted, the first error wins.
fn restore_governors(saved: &[GovernorSetting]) -> Result<()> {
    let mut first_err = None;
    for setting in saved {
        let res = setting.domain.set_range(setting.min, setting.max);
        if let Err(e) = res {
            if first_err.is_none() {
                first_err = Some(e.context(format!("restoring {}", setting.domain.name())));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn governor_target(min: usize, max: usize, avail: &[usize], percent: u32) -> usize {
    let target = (max - min) * percent as usize / 100 + min;
    if avail.is_empty() {
        return target;
    }
    let mut closest = avail[0];
    for &freq in avail {
        if freq.abs_diff(target) < closest.abs_diff(target) {
            closest = freq;
        }
    }
    closest
}
