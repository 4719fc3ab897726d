//! Processes, process groups and sessions.
//!
//! A process owns exactly one address space, a handle table, its thread
//! list, a credential tuple and the signal-action table. Parent links
//! root the ownership graph: parents own children, children keep weak
//! backlinks. Zombies are waitable through the embedded header until the
//! parent reaps them.

pub mod handle;

pub use handle::{
    HandleTable, HandleType, KernelObject, RawHandle, HANDLE_ANY, HANDLE_CURRENT, HANDLE_INVALID,
};

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use alloc::{
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use spin::Mutex;

use crate::error::KernelResult;
use crate::mm::AddressSpace;
use crate::sched::{self, Thread};
use crate::signal::{SigAction, SIGCHLD, SIGMAX};
use crate::sync::wait::{self, WaitHeader, Waitable};

/// Process identifier; globally unique, monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Real/effective/saved uid and gid plus supplementary groups.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn root() -> Self {
        Self {
            ruid: 0,
            euid: 0,
            suid: 0,
            rgid: 0,
            egid: 0,
            sgid: 0,
            groups: Vec::new(),
        }
    }

    /// Membership test used by VFS permission checks and capabilities.
    pub fn in_group(&self, gid: u32) -> bool {
        self.egid == gid || self.groups.contains(&gid)
    }
}

pub struct ProcessGroup {
    pub pgid: u64,
    pub members: Mutex<Vec<Weak<Process>>>,
    pub session: Mutex<Option<Arc<Session>>>,
}

impl ProcessGroup {
    pub fn new(pgid: u64) -> Arc<Self> {
        Arc::new(Self {
            pgid,
            members: Mutex::new(Vec::new()),
            session: Mutex::new(None),
        })
    }

    pub fn each_member(&self, mut f: impl FnMut(&Arc<Process>)) {
        let members = self.members.lock();
        for weak in members.iter() {
            if let Some(proc) = weak.upgrade() {
                f(&proc);
            }
        }
    }
}

pub struct Session {
    pub sid: u64,
    pub leader: Mutex<Weak<Process>>,
    pub controlling_tty: Mutex<Option<Arc<crate::fs::tty::Tty>>>,
}

impl Session {
    pub fn new(sid: u64) -> Arc<Self> {
        Arc::new(Self {
            sid,
            leader: Mutex::new(Weak::new()),
            controlling_tty: Mutex::new(None),
        })
    }
}

pub struct Process {
    pub pid: ProcessId,
    /// Path of the exec'd image.
    pub exec_path: Mutex<String>,
    pub cmdline: Mutex<Vec<String>>,
    pub space: Arc<AddressSpace>,
    pub handles: HandleTable,
    pub threads: Mutex<Vec<Arc<Thread>>>,
    pub creds: Mutex<Credentials>,
    pub parent: Mutex<Weak<Process>>,
    pub children: Mutex<Vec<Arc<Process>>>,
    pub group: Mutex<Option<Arc<ProcessGroup>>>,
    pub umask: AtomicU32,
    pub cwd: Mutex<Option<Arc<crate::fs::dirent::Dirent>>>,
    pub actions: Mutex<[SigAction; SIGMAX + 1]>,
    exit_status: AtomicI32,
    dead: AtomicBool,
    /// Signaled when the process becomes a zombie; `wait` parks here.
    zombie: WaitHeader,
}

static PROCESSES: Mutex<BTreeMap<u64, Arc<Process>>> = Mutex::new(BTreeMap::new());

impl Process {
    pub fn new(exec_path: String, space: Arc<AddressSpace>) -> Arc<Self> {
        let pid = ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed));
        let proc = Arc::new(Self {
            pid,
            exec_path: Mutex::new(exec_path),
            cmdline: Mutex::new(Vec::new()),
            space: space.clone(),
            handles: HandleTable::new(),
            threads: Mutex::new(Vec::new()),
            creds: Mutex::new(Credentials::root()),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            group: Mutex::new(None),
            umask: AtomicU32::new(0o022),
            cwd: Mutex::new(None),
            actions: Mutex::new([SigAction::default(); SIGMAX + 1]),
            exit_status: AtomicI32::new(0),
            dead: AtomicBool::new(false),
            zombie: WaitHeader::new(true, false),
        });
        space.set_owner(&proc);
        PROCESSES.lock().insert(pid.0, proc.clone());
        proc
    }

    pub fn by_pid(pid: ProcessId) -> Option<Arc<Process>> {
        PROCESSES.lock().get(&pid.0).cloned()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// The process of the calling thread.
    pub fn current() -> Option<Arc<Process>> {
        sched::current_thread().and_then(|t| t.process())
    }

    /// Attach a thread to this process.
    pub fn adopt_thread(self: &Arc<Self>, thread: &Arc<Thread>) {
        thread.set_process(self);
        self.threads.lock().push(thread.clone());
    }

    /// Link `child` under `self`.
    pub fn adopt_child(self: &Arc<Self>, child: &Arc<Process>) {
        *child.parent.lock() = Arc::downgrade(self);
        self.children.lock().push(child.clone());
    }

    /// Join a process group.
    pub fn join_group(self: &Arc<Self>, group: &Arc<ProcessGroup>) {
        if let Some(old) = self.group.lock().take() {
            old.members
                .lock()
                .retain(|w| w.upgrade().map(|p| p.pid) != Some(self.pid));
        }
        group.members.lock().push(Arc::downgrade(self));
        *self.group.lock() = Some(group.clone());
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.group.lock().as_ref().and_then(|g| g.session.lock().clone())
    }

    /// Fork: new process with a CoW copy of the address space, cloned
    /// credentials, handle table, signal actions, cwd and group links.
    pub fn fork(self: &Arc<Self>) -> KernelResult<Arc<Process>> {
        let child_space = AddressSpace::new_user(self.space.pool())?;
        child_space.fork_from(&self.space)?;
        let child = Self::new(self.exec_path.lock().clone(), child_space);
        *child.cmdline.lock() = self.cmdline.lock().clone();
        *child.creds.lock() = self.creds.lock().clone();
        *child.actions.lock() = *self.actions.lock();
        *child.cwd.lock() = self.cwd.lock().clone();
        child
            .umask
            .store(self.umask.load(Ordering::Acquire), Ordering::Release);
        child.handles.copy_from(&self.handles);
        self.adopt_child(&child);
        if let Some(group) = self.group.lock().clone() {
            child.join_group(&group);
        }
        Ok(child)
    }

    /// Terminate the process: mark dead, kill remaining threads, reparent
    /// children to our parent, signal the zombie header and send SIGCHLD.
    pub fn exit(self: &Arc<Self>, status: i32) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        self.exit_status.store(status, Ordering::Release);
        for thread in self.threads.lock().iter() {
            thread.request_kill();
            let _ = crate::signal::interrupt_blocked_thread(thread);
        }
        let parent = self.parent.lock().upgrade();
        // Reparent live children one level up.
        let children: Vec<Arc<Process>> = core::mem::take(&mut *self.children.lock());
        if let Some(parent) = &parent {
            for child in children {
                parent.adopt_child(&child);
            }
        }
        let _ = wait::signal(&self.zombie, true, false);
        if let Some(parent) = parent {
            let _ = crate::signal::kill_process(&parent, SIGCHLD);
        }
    }

    /// Block until the process has exited; returns its status. Reaps the
    /// table entry on the first successful wait.
    pub fn wait_for_exit(self: &Arc<Self>) -> KernelResult<i32> {
        if !self.is_dead() {
            wait::wait_one(&self.zombie)?;
        }
        PROCESSES.lock().remove(&self.pid.0);
        Ok(self.exit_status())
    }
}

impl Waitable for Process {
    fn wait_header(&self) -> &WaitHeader {
        &self.zombie
    }
}

static NEXT_SID: AtomicU64 = AtomicU64::new(1);

/// Create a new session with the caller as leader, in a fresh group.
pub fn new_session(leader: &Arc<Process>) -> Arc<Session> {
    let session = Session::new(NEXT_SID.fetch_add(1, Ordering::Relaxed));
    *session.leader.lock() = Arc::downgrade(leader);
    let group = ProcessGroup::new(leader.pid.0);
    *group.session.lock() = Some(session.clone());
    leader.join_group(&group);
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::context::test_support::user_space;
    use crate::sched::{Priority, ThreadState};

    fn fresh_process(name: &str) -> Arc<Process> {
        Process::new(String::from(name), user_space(16))
    }

    #[test]
    fn pids_are_monotonic_and_registered() {
        let a = fresh_process("a");
        let b = fresh_process("b");
        assert!(b.pid.0 > a.pid.0);
        assert!(Process::by_pid(a.pid).is_some());
    }

    #[test]
    fn exit_signals_zombie_and_reparents() {
        let grandparent = fresh_process("grandparent");
        let parent = fresh_process("parent");
        let child = fresh_process("child");
        grandparent.adopt_child(&parent);
        parent.adopt_child(&child);

        parent.exit(7);
        assert!(parent.is_dead());
        assert_eq!(parent.exit_status(), 7);
        // The orphan moved up one level.
        assert!(grandparent
            .children
            .lock()
            .iter()
            .any(|p| p.pid == child.pid));

        // Waiting after death returns immediately with the status.
        let waiter = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&waiter);
        assert_eq!(parent.wait_for_exit(), Ok(7));
        assert!(Process::by_pid(parent.pid).is_none());
    }

    #[test]
    fn wait_blocks_until_exit() {
        let proc = fresh_process("sleeper");
        let p2 = proc.clone();
        let waiter = Thread::new(None, Priority::Normal, u64::MAX);
        let w2 = waiter.clone();
        let join = std::thread::spawn(move || {
            sched::adopt(&w2);
            p2.wait_for_exit()
        });
        while waiter.state() != ThreadState::Blocked {
            std::thread::yield_now();
        }
        proc.exit(3);
        assert_eq!(join.join().unwrap(), Ok(3));
    }

    #[test]
    fn fork_copies_credentials_and_links() {
        let t = Thread::new(None, Priority::Normal, u64::MAX);
        sched::adopt(&t);
        let parent = fresh_process("parent");
        parent.creds.lock().euid = 1000;
        let session = new_session(&parent);
        let child = parent.fork().unwrap();
        assert_eq!(child.creds.lock().euid, 1000);
        assert_eq!(
            child.parent.lock().upgrade().map(|p| p.pid),
            Some(parent.pid)
        );
        assert_eq!(child.session().map(|s| s.sid), Some(session.sid));
    }

    #[test]
    fn group_membership_moves_with_join() {
        let a = fresh_process("a");
        let g1 = ProcessGroup::new(100);
        let g2 = ProcessGroup::new(200);
        a.join_group(&g1);
        a.join_group(&g2);
        let mut seen = 0;
        g1.each_member(|_| seen += 1);
        assert_eq!(seen, 0);
        g2.each_member(|p| assert_eq!(p.pid, a.pid));
    }
}
