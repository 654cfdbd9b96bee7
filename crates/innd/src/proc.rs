//! Child-process table. Children are spawned for program feeds, channel
//! and exploder feeds, and control-message handlers; SIGCHLD only sets a
//! flag, and the reactor collects exits synchronously between passes.

use std::process::Child;

#[derive(Debug)]
pub struct ProcEntry {
    pub child: Child,
    /// Owning site index, when a site cares about this child's death.
    pub site: Option<usize>,
    pub started: i64,
}

/// A collected exit, reported back to the owning site.
#[derive(Debug, Clone, Copy)]
pub struct DeadProc {
    pub site: Option<usize>,
    pub pid: u32,
    pub status: i32,
    pub started: i64,
    pub collected: i64,
}

#[derive(Debug, Default)]
pub struct ProcTable {
    procs: Vec<ProcEntry>,
}

impl ProcTable {
    pub fn new() -> ProcTable {
        ProcTable::default()
    }

    pub fn watch(&mut self, child: Child, site: Option<usize>, now: i64) {
        self.procs.push(ProcEntry { child, site, started: now });
    }

    /// Stop caring about any child owned by a site (the site is being
    /// torn down or replaced its process).
    pub fn unwatch_site(&mut self, site: usize) {
        for p in &mut self.procs {
            if p.site == Some(site) {
                p.site = None;
            }
        }
    }

    /// Collect every child that has exited. Children still running stay
    /// in the table.
    pub fn scan(&mut self, now: i64) -> Vec<DeadProc> {
        let mut dead = Vec::new();
        let mut i = 0;
        while i < self.procs.len() {
            match self.procs[i].child.try_wait() {
                Ok(Some(status)) => {
                    let entry = self.procs.swap_remove(i);
                    dead.push(DeadProc {
                        site: entry.site,
                        pid: entry.child.id(),
                        status: status.code().unwrap_or(-1),
                        started: entry.started,
                        collected: now,
                    });
                }
                Ok(None) => i += 1,
                Err(e) => {
                    tracing::error!(error = %e, "cant wait for child");
                    self.procs.swap_remove(i);
                }
            }
        }
        dead
    }

    /// Best-effort TERM to all remaining children at shutdown.
    pub fn kill_all(&mut self) {
        for p in &mut self.procs {
            let _ = p.child.kill();
            let _ = p.child.wait();
        }
        self.procs.clear();
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn scan_collects_exits() {
        let mut table = ProcTable::new();
        let child = Command::new("true").stdout(Stdio::null()).spawn().unwrap();
        table.watch(child, Some(2), 10);

        // The child exits on its own; poll until collected.
        let mut dead = Vec::new();
        for _ in 0..100 {
            dead = table.scan(11);
            if !dead.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].site, Some(2));
        assert_eq!(dead[0].status, 0);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn unwatch_detaches_site() {
        let mut table = ProcTable::new();
        let child = Command::new("true").stdout(Stdio::null()).spawn().unwrap();
        table.watch(child, Some(5), 1);
        table.unwatch_site(5);
        for _ in 0..100 {
            let dead = table.scan(2);
            if !dead.is_empty() {
                assert_eq!(dead[0].site, None);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("child never collected");
    }
}
