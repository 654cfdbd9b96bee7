//! The server value threaded through every reactor callback, and the
//! reactor loop itself: a single-threaded poll multiplex over all
//! channels, with priority slots for the control and listener
//! descriptors, a round-robin data pass, sleepers, and idle sweeps.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;

use active::Active;
use history::History;
use newsfeeds::{HostTable, Newsfeeds, Site};
use overview::{Overview, Schema};
use storage::{DirSpool, Spool};

use crate::chan::{ChanState, ChanType, Channel, ChannelTable, Wake, chan_write};
use crate::config::Config;
use crate::headers::CleanedArticle;
use crate::proc::ProcTable;
use crate::site::SiteState;
use crate::wip::WipTable;

pub static GOT_TERMINATE: AtomicBool = AtomicBool::new(false);
pub static GOT_HUP: AtomicBool = AtomicBool::new(false);
pub static NEED_REAP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    GOT_TERMINATE.store(true, Ordering::Relaxed);
}

extern "C" fn on_hup(_sig: libc::c_int) {
    GOT_HUP.store(true, Ordering::Relaxed);
}

extern "C" fn on_chld(_sig: libc::c_int) {
    NEED_REAP.store(true, Ordering::Relaxed);
}

/// Handlers only set flags; all real work happens at the top of the next
/// reactor pass.
pub fn install_signal_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_RESTART;

        action.sa_sigaction = on_terminate as usize;
        libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());

        action.sa_sigaction = on_hup as usize;
        libc::sigaction(libc::SIGHUP, &action, std::ptr::null_mut());

        action.sa_sigaction = on_chld as usize;
        libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());

        let mut ignore: libc::sigaction = std::mem::zeroed();
        ignore.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(libc::SIGPIPE, &ignore, std::ptr::null_mut());
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Operating mode. Paused and throttled servers stop accepting articles;
/// only a control-channel `go` resumes a throttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Running,
    Paused(String),
    Throttled(String),
}

/// Policy hook applied to every article after the duplicate check.
/// Returning a reason text vetoes the article.
pub trait ArticleFilter {
    fn filter(&self, art: &CleanedArticle) -> Option<String>;
}

/// What a read/wake handler wants done with its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Close,
}

const BLOCKED_WRITE_CLOSE: u32 = 5;

pub struct Server {
    pub cfg: Config,
    pub mode: Mode,
    pub history: History,
    pub overview: Overview,
    pub active: Active,
    pub spool: Box<dyn Spool>,
    pub me: Site,
    pub sites: Vec<SiteState>,
    pub hosts: HostTable,
    pub nolimit: HostTable,
    /// Per-group subscriber site indexes, parallel to `active.groups()`.
    pub group_feeds: Vec<Vec<usize>>,
    pub group_poison: Vec<Vec<usize>>,
    pub chans: ChannelTable,
    pub wip: WipTable,
    pub procs: ProcTable,
    pub filters: Vec<Box<dyn ArticleFilter>>,
    pub now: i64,
    /// I/O errors tolerated before the server throttles itself.
    pub error_count: i32,
    pub nntp_count: usize,
    pub tracing_all: bool,
    pub remconn_fd: Option<RawFd>,
    pub control_fd: Option<RawFd>,
    pub localconn_fd: Option<RawFd>,
    /// Recent remote connections, for the per-host limiter.
    pub conn_window: Vec<(String, i64)>,
    /// File-feed sites with an open descriptor, most recent first.
    pub file_lru: Vec<usize>,
    last_housekeeping: i64,
    last_dispatched: usize,
}

const IO_ERROR_TOLERANCE: i32 = 50;

impl Server {
    pub fn new(cfg: Config) -> anyhow::Result<Server> {
        let now = unix_now();

        for dir in [&cfg.outgoing_dir, &cfg.incoming_dir, &cfg.run_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let active = Active::open(&cfg.active_file)
            .with_context(|| format!("reading active file {}", cfg.active_file.display()))?;

        let feeds_text = std::fs::read_to_string(&cfg.newsfeeds_file)
            .with_context(|| format!("reading {}", cfg.newsfeeds_file.display()))?;
        let feeds = Newsfeeds::parse(&feeds_text).context("parsing newsfeeds")?;

        let hosts = match std::fs::read_to_string(&cfg.hosts_file) {
            Ok(text) => HostTable::parse(&text).context("parsing hosts.nntp")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HostTable::default(),
            Err(e) => return Err(e).context("reading hosts.nntp"),
        };
        let nolimit = match std::fs::read_to_string(&cfg.hosts_nolimit_file) {
            Ok(text) => HostTable::parse(&text).context("parsing hosts.nntp.nolimit")?,
            Err(_) => HostTable::default(),
        };

        let schema = match &cfg.overview_schema {
            Some(path) => Schema::load(path)
                .with_context(|| format!("reading schema {}", path.display()))?,
            None => Schema::default_schema(),
        };
        let overview = Overview::open(&cfg.overview_dir, schema).context("opening overview")?;

        let history = History::open(&cfg.history_file, cfg.history_sync_count)
            .context("opening history")?;
        let spool = Box::new(DirSpool::open(&cfg.spool_dir).context("opening spool")?);

        let sites = feeds
            .sites
            .iter()
            .map(|s| SiteState::new(s.clone(), &cfg.outgoing_dir))
            .collect();

        let wip = WipTable::new(cfg.wip_hold.as_secs() as i64);

        let mut server = Server {
            mode: Mode::Running,
            history,
            overview,
            active,
            spool,
            me: feeds.me,
            sites,
            hosts,
            nolimit,
            group_feeds: Vec::new(),
            group_poison: Vec::new(),
            chans: ChannelTable::new(),
            wip,
            procs: ProcTable::new(),
            filters: Vec::new(),
            now,
            error_count: IO_ERROR_TOLERANCE,
            nntp_count: 0,
            tracing_all: cfg.tracing,
            remconn_fd: None,
            control_fd: None,
            localconn_fd: None,
            conn_window: Vec::new(),
            file_lru: Vec::new(),
            last_housekeeping: now,
            last_dispatched: 0,
            cfg,
        };
        server.rebuild_subscriptions();
        Ok(server)
    }

    /// Recompute which sites subscribe to which groups. Runs at startup
    /// and after any structural active-file change or reload.
    pub fn rebuild_subscriptions(&mut self) {
        let mut feeds = Vec::with_capacity(self.active.len());
        let mut poison = Vec::with_capacity(self.active.len());
        for group in self.active.groups() {
            let moderated = group.flag == active::GroupFlag::Moderated;
            let mut f = Vec::new();
            let mut p = Vec::new();
            for (i, site) in self.sites.iter().enumerate() {
                let sc = &site.config;
                if sc.just_moderated && !moderated {
                    continue;
                }
                if sc.just_unmoderated && moderated {
                    continue;
                }
                if sc.wants_group(Some(&self.me), &group.name) {
                    f.push(i);
                }
                if (sc.has_poison_patterns() || self.me.has_poison_patterns())
                    && sc.poisons_group(Some(&self.me), &group.name)
                {
                    p.push(i);
                }
            }
            feeds.push(f);
            poison.push(p);
        }
        self.group_feeds = feeds;
        self.group_poison = poison;
    }

    pub fn throttle(&mut self, reason: &str) {
        if self.mode == Mode::Running {
            tracing::error!(reason, "throttling");
            self.mode = Mode::Throttled(reason.to_string());
        }
    }

    /// Count an I/O error against the tolerance; ENOSPC and exhaustion
    /// throttle the whole server.
    pub fn io_error(&mut self, when: &str, err: &std::io::Error) {
        tracing::error!(when, error = %err, "I/O error");
        self.error_count -= 1;
        if self.error_count <= 0 || err.raw_os_error() == Some(libc::ENOSPC) {
            self.throttle(&format!("I/O error: {when}"));
        }
    }

    pub fn running(&self) -> bool {
        self.mode == Mode::Running
    }

    pub fn write_pid_file(&self) -> anyhow::Result<()> {
        std::fs::write(self.cfg.pid_file(), format!("{}\n", std::process::id()))
            .context("writing pid file")
    }

    // ---- channel plumbing -------------------------------------------------

    pub fn insert_channel(&mut self, mut ch: Channel, reading: bool) -> RawFd {
        ch.trace = self.tracing_all;
        ch.reading = reading;
        if ch.ctype == ChanType::Nntp {
            self.nntp_count += 1;
        }
        self.chans.insert(ch)
    }

    /// Tear a channel down, logging its totals.
    pub fn close_channel(&mut self, ch: Channel) {
        match ch.ctype {
            ChanType::Nntp => {
                self.nntp_count = self.nntp_count.saturating_sub(1);
                tracing::info!(
                    channel = %ch.name(),
                    seconds = self.now - ch.started,
                    accepted = ch.received,
                    refused = ch.refused,
                    rejected = ch.rejected,
                    "closed"
                );
                self.wip.free(ch.cur_hash);
            }
            ChanType::Reject => {
                tracing::info!(channel = %ch.name(), rejected = ch.rejected, "closed");
            }
            _ => {
                if !ch.out_buf.is_empty() {
                    tracing::info!(channel = %ch.name(), lost = ch.out_buf.len(), "closed lost");
                } else {
                    tracing::info!(channel = %ch.name(), "closed");
                }
            }
        }
        // Dropping the channel closes its descriptor.
    }

    // ---- the reactor ------------------------------------------------------

    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            if NEED_REAP.swap(false, Ordering::Relaxed) {
                self.reap_children();
            }

            // Build the poll set.
            let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.chans.len());
            for fd in self.chans.fds() {
                let ch = self.chans.get(fd).unwrap();
                let mut events = 0i16;
                if ch.reading {
                    events |= libc::POLLIN;
                }
                if ch.writing {
                    events |= libc::POLLOUT;
                }
                if events != 0 || ch.waketime.is_some() {
                    pollfds.push(libc::pollfd { fd, events, revents: 0 });
                }
            }

            let timeout_ms = self.poll_timeout_ms();
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };

            if GOT_TERMINATE.load(Ordering::Relaxed) {
                tracing::info!("exiting because of signal");
                self.shutdown("signal")?;
                return Ok(());
            }
            if GOT_HUP.swap(false, Ordering::Relaxed) {
                self.tracing_all = !self.tracing_all;
                tracing::info!(trace = self.tracing_all, "trace toggled");
            }
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    tracing::error!(error = %err, "cant poll");
                }
                continue;
            }

            self.now = unix_now();
            if self.now - self.last_housekeeping >= self.cfg.timeout.as_secs() as i64 {
                self.housekeeping();
                self.last_housekeeping = self.now;
            }

            let mut ready: Vec<(RawFd, i16)> =
                pollfds.iter().map(|p| (p.fd, p.revents)).collect();

            // Privileged descriptors first: the control channel and the
            // remote listener get served ahead of data peers.
            for special in [self.control_fd, self.remconn_fd].into_iter().flatten() {
                if let Some(entry) = ready.iter_mut().find(|(fd, _)| *fd == special) {
                    if entry.1 & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                        entry.1 = 0;
                        self.dispatch_read(special);
                    }
                }
            }

            // Round-robin through the rest, starting past where the
            // previous pass stopped.
            let start = ready
                .iter()
                .position(|(fd, _)| *fd as usize > self.last_dispatched)
                .unwrap_or(0);
            let ready_len = ready.len();
            ready.rotate_left(start.min(ready_len));

            for (fd, revents) in ready {
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    self.dispatch_read(fd);
                    self.last_dispatched = fd as usize;
                }
                if NEED_REAP.swap(false, Ordering::Relaxed) {
                    self.reap_children();
                }
                if revents & libc::POLLOUT != 0 {
                    self.dispatch_write(fd);
                }
            }

            self.wake_sleepers();
            self.sweep_idle();
        }
    }

    fn poll_timeout_ms(&self) -> i32 {
        let mut timeout = self.cfg.timeout.as_secs() as i64;
        for fd in self.chans.fds() {
            if let Some(ch) = self.chans.get(fd) {
                if let Some(when) = ch.waketime {
                    timeout = timeout.min((when - self.now).max(0));
                }
            }
        }
        (timeout.clamp(0, 3600) * 1000) as i32 + 100
    }

    fn housekeeping(&mut self) {
        if let Err(e) = self.history.sync() {
            let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            self.io_error("history sync", &io);
        }
        if self.active.dirty() {
            if let Err(e) = self.active.flush() {
                let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                self.io_error("active flush", &io);
            }
        }
    }

    fn reap_children(&mut self) {
        let dead = self.procs.scan(self.now);
        for d in dead {
            tracing::info!(
                pid = d.pid,
                status = d.status,
                elapsed = d.collected - d.started,
                "child exited"
            );
            if let Some(site) = d.site {
                self.site_proc_died(site);
            }
        }
    }

    fn dispatch_read(&mut self, fd: RawFd) {
        let Some(mut ch) = self.chans.take(fd) else { return };
        if !ch.reading {
            self.chans.put(ch);
            return;
        }
        ch.last_active = self.now;
        let disp = match ch.ctype {
            ChanType::RemConn => self.rc_reader(&mut ch),
            ChanType::LocalConn => self.lc_reader(&mut ch),
            ChanType::Control => self.cc_reader(&mut ch),
            ChanType::Nntp => self.nc_reader(&mut ch),
            ChanType::Reject => self.reject_reader(&mut ch),
            _ => {
                tracing::error!(channel = %ch.name(), "unexpected readable channel");
                Disposition::Keep
            }
        };
        match disp {
            Disposition::Keep => self.chans.put(ch),
            Disposition::Close => self.close_channel(ch),
        }
    }

    fn reject_reader(&mut self, ch: &mut Channel) -> Disposition {
        // Drain and discard; EOF tears the channel down.
        let mut buf = [0u8; 512];
        match crate::chan::chan_read(ch.raw(), &mut buf) {
            Ok(0) => Disposition::Close,
            Ok(_) => Disposition::Keep,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Disposition::Keep,
            Err(_) => Disposition::Close,
        }
    }

    /// Drain a writable channel's output buffer.
    fn dispatch_write(&mut self, fd: RawFd) {
        let Some(mut ch) = self.chans.take(fd) else { return };
        if !ch.writing || ch.out_buf.is_empty() {
            ch.writing = false;
            self.chans.put(ch);
            return;
        }
        ch.last_active = self.now;
        match chan_write(ch.raw(), ch.out_buf.pending()) {
            Ok(n) => {
                ch.bad_writes = 0;
                ch.blocked_writes = 0;
                ch.out_buf.advance(n);
                if ch.out_buf.is_empty() {
                    ch.writing = false;
                    self.writer_done(ch);
                } else {
                    self.chans.put(ch);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                ch.bad_writes += 1;
                ch.writing = false;
                ch.blocked_writes += 1;
                if ch.blocked_writes > BLOCKED_WRITE_CLOSE {
                    tracing::error!(channel = %ch.name(), "blocked closing");
                    self.site_chan_close(ch);
                    return;
                }
                let backoff =
                    self.cfg.block_backoff.as_secs() as i64 * ch.blocked_writes as i64;
                tracing::error!(channel = %ch.name(), backoff, "blocked sleeping");
                ch.sleep_until(self.now + backoff, Wake::WriteRetry);
                self.chans.put(ch);
            }
            Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                tracing::error!(channel = %ch.name(), "broken pipe");
                self.site_chan_close(ch);
            }
            Err(e) => {
                tracing::error!(channel = %ch.name(), error = %e, "cant write");
                ch.bad_writes += 1;
                if ch.bad_writes >= self.cfg.bad_io_count {
                    tracing::error!(channel = %ch.name(), "sleeping");
                    ch.writing = false;
                    ch.sleep_until(
                        self.now + self.cfg.pause_retry_time.as_secs() as i64,
                        Wake::WriteRetry,
                    );
                }
                self.chans.put(ch);
            }
        }
    }

    fn writer_done(&mut self, mut ch: Channel) {
        match ch.ctype {
            ChanType::Nntp | ChanType::LocalConn | ChanType::Control => {
                if ch.state == ChanState::WriteGoodbye {
                    self.close_channel(ch);
                } else {
                    ch.reading = true;
                    self.chans.put(ch);
                }
            }
            _ => self.chans.put(ch),
        }
    }

    fn wake_sleepers(&mut self) {
        for fd in self.chans.fds() {
            let Some(ch) = self.chans.get(fd) else { continue };
            let due = matches!(ch.waketime, Some(when) if when <= self.now);
            if !due {
                continue;
            }
            let Some(mut ch) = self.chans.take(fd) else { continue };
            let wake = ch.wake.take();
            ch.stop_sleeping();
            ch.last_active = self.now;
            match wake {
                Some(Wake::WriteRetry) => {
                    tracing::info!(channel = %ch.name(), "wakeup");
                    if !ch.out_buf.is_empty() {
                        ch.writing = true;
                    }
                    self.chans.put(ch);
                }
                Some(Wake::SpoolRetry(site)) => {
                    self.chans.put(ch);
                    self.site_spool_wake(site, fd);
                }
                Some(Wake::PausedArticle) => {
                    if ch.state == ChanState::Paused {
                        ch.state = ChanState::GetArticle;
                    }
                    let disp = self.nc_process(&mut ch);
                    if ch.state != ChanState::Paused {
                        ch.reading = true;
                    }
                    match disp {
                        Disposition::Keep => self.chans.put(ch),
                        Disposition::Close => self.close_channel(ch),
                    }
                }
                None => self.chans.put(ch),
            }
        }
    }

    fn sweep_idle(&mut self) {
        let reject_timeout = self.cfg.reject_timeout.as_secs() as i64;
        let peer_timeout = self.cfg.peer_timeout.as_secs() as i64;
        let inactive = self.cfg.inactive_time.as_secs() as i64;

        for fd in self.chans.fds() {
            let Some(ch) = self.chans.get(fd) else { continue };
            match ch.ctype {
                ChanType::Reject if ch.last_active + reject_timeout < self.now => {
                    let ch = self.chans.take(fd).unwrap();
                    tracing::info!(channel = %ch.name(), "timeout reject");
                    self.close_channel(ch);
                }
                ChanType::Nntp if ch.last_active + ch.next_log + inactive < self.now => {
                    let silence = self.now - ch.last_active;
                    let name = ch.name();
                    let ch_mut = self.chans.get_mut(fd).unwrap();
                    ch_mut.next_log += inactive;
                    tracing::info!(channel = %name, minutes = silence / 60, "inactive");
                    if silence > peer_timeout {
                        let ch = self.chans.take(fd).unwrap();
                        tracing::info!(channel = %ch.name(), "timeout");
                        self.close_channel(ch);
                    }
                }
                _ => {}
            }
        }
    }

    fn housekeeping_final(&mut self) -> anyhow::Result<()> {
        self.history.sync().context("history sync")?;
        self.active.flush().context("active flush")?;
        Ok(())
    }

    /// Orderly teardown: flush the feeds, sync the databases, remove the
    /// pid file and sockets.
    pub fn shutdown(&mut self, why: &str) -> anyhow::Result<()> {
        tracing::info!(why, "shutting down");
        self.site_flush_all();
        for fd in self.chans.fds() {
            if let Some(ch) = self.chans.take(fd) {
                self.close_channel(ch);
            }
        }
        self.procs.kill_all();
        self.housekeeping_final()?;
        let _ = std::fs::remove_file(self.cfg.pid_file());
        let _ = std::fs::remove_file(self.cfg.control_socket());
        let _ = std::fs::remove_file(self.cfg.local_socket());
        Ok(())
    }
}

