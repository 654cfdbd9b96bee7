//! The control channel: a Unix-domain datagram socket under the run
//! directory. Each datagram carries one newline-terminated command; the
//! reply datagram is a status line, `0 …` for success and `1 …` for
//! failure.

use std::os::fd::{FromRawFd, OwnedFd};

use anyhow::Context;

use newsfeeds::{HostTable, Newsfeeds};

use crate::chan::{ChanState, ChanType, Channel};
use crate::server::{Disposition, Mode, Server, GOT_TERMINATE};
use crate::site::SiteState;

impl Server {
    pub fn cc_setup(&mut self) -> anyhow::Result<()> {
        let path = self.cfg.control_socket();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("unlinking stale control socket"),
        }

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("control socket");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let addr = sockaddr_un(&path)?;
        let rc = unsafe {
            libc::bind(
                raw(&fd),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("binding {}", path.display()));
        }
        crate::chan::prepare_fd(raw(&fd))?;

        let mut ch = Channel::new(fd, ChanType::Control, ChanState::Waiting, self.now);
        ch.hostname = "control".to_string();
        let fd = self.insert_channel(ch, true);
        self.control_fd = Some(fd);
        tracing::info!(path = %path.display(), "control channel up");
        Ok(())
    }

    pub fn cc_reader(&mut self, ch: &mut Channel) -> Disposition {
        let mut buf = [0u8; 4096];
        let mut peer: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        let mut peer_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                ch.raw(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                &mut peer as *mut libc::sockaddr_un as *mut libc::sockaddr,
                &mut peer_len,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                tracing::error!(error = %err, "cant recvfrom");
            }
            return Disposition::Keep;
        }

        let line = String::from_utf8_lossy(&buf[..n as usize]);
        let line = line.trim_end_matches(['\n', '\r', '\0']);
        tracing::info!(command = line, "control command");
        let reply = self.cc_execute(line);

        if peer_len > 0 {
            let rc = unsafe {
                libc::sendto(
                    ch.raw(),
                    reply.as_ptr().cast(),
                    reply.len(),
                    0,
                    &peer as *const libc::sockaddr_un as *const libc::sockaddr,
                    peer_len,
                )
            };
            if rc < 0 {
                tracing::error!(error = %std::io::Error::last_os_error(), "cant sendto");
            }
        }
        Disposition::Keep
    }

    /// Run one administrative command, returning the status line.
    pub fn cc_execute(&mut self, line: &str) -> String {
        let (word, arg) = match line.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (line, ""),
        };
        match word.to_ascii_lowercase().as_str() {
            "pause" => {
                self.mode = Mode::Paused(nonempty(arg, "paused"));
                "0 ok".to_string()
            }
            "throttle" => {
                self.mode = Mode::Throttled(nonempty(arg, "throttled"));
                "0 ok".to_string()
            }
            "go" => {
                self.mode = Mode::Running;
                "0 ok".to_string()
            }
            "mode" => match &self.mode {
                Mode::Running => format!(
                    "0 running, {} channels, {} children",
                    self.chans.len(),
                    self.procs.len()
                ),
                Mode::Paused(r) => format!("0 paused: {r}"),
                Mode::Throttled(r) => format!("0 throttled: {r}"),
            },
            "flush" => {
                if arg.is_empty() || arg == "all" {
                    for idx in 0..self.sites.len() {
                        self.site_flush(idx, true);
                    }
                    "0 ok".to_string()
                } else {
                    match self.sites.iter().position(|s| s.config.name == arg) {
                        Some(idx) => {
                            self.site_flush(idx, true);
                            "0 ok".to_string()
                        }
                        None => format!("1 no such site {arg}"),
                    }
                }
            }
            "reload" => self.cc_reload(arg),
            "checkfile" => {
                match std::fs::read_to_string(&self.cfg.newsfeeds_file)
                    .map_err(|e| e.to_string())
                    .and_then(|t| Newsfeeds::parse(&t).map_err(|e| e.to_string()))
                {
                    Ok(_) => "0 ok".to_string(),
                    Err(e) => format!("1 {e}"),
                }
            }
            "cancel" => match self.art_cancel_by_id(arg, "control", true) {
                Ok(()) => "0 ok".to_string(),
                Err(e) => format!("1 {e}"),
            },
            "addhist" => self.cc_addhist(arg),
            "renumber" => self.cc_renumber(arg),
            "newgroup" => {
                let (name, flag) = match arg.split_once(char::is_whitespace) {
                    Some((n, f)) => (n, f.trim()),
                    None => (arg, "y"),
                };
                if name.is_empty() {
                    return "1 missing group name".to_string();
                }
                match self.active.newgroup(name, parse_flag(flag)) {
                    Ok(()) => {
                        self.rebuild_subscriptions();
                        "0 ok".to_string()
                    }
                    Err(e) => format!("1 {e}"),
                }
            }
            "rmgroup" => match self.active.rmgroup(arg) {
                Ok(()) => {
                    self.rebuild_subscriptions();
                    "0 ok".to_string()
                }
                Err(e) => format!("1 {e}"),
            },
            "changegroup" => {
                let (name, flag) = match arg.split_once(char::is_whitespace) {
                    Some((n, f)) => (n, f.trim()),
                    None => return "1 usage: changegroup name flag".to_string(),
                };
                match self.active.changegroup(name, parse_flag(flag)) {
                    Ok(()) => {
                        self.rebuild_subscriptions();
                        "0 ok".to_string()
                    }
                    Err(e) => format!("1 {e}"),
                }
            }
            "trace" => {
                self.tracing_all = arg == "on";
                "0 ok".to_string()
            }
            "shutdown" => {
                tracing::info!(reason = arg, "shutdown requested");
                GOT_TERMINATE.store(true, std::sync::atomic::Ordering::Relaxed);
                "0 ok".to_string()
            }
            _ => format!("1 unknown command {word}"),
        }
    }

    fn cc_reload(&mut self, what: &str) -> String {
        let what = if what.is_empty() { "all" } else { what };
        if what == "newsfeeds" || what == "all" {
            let text = match std::fs::read_to_string(&self.cfg.newsfeeds_file) {
                Ok(t) => t,
                Err(e) => return format!("1 {e}"),
            };
            let feeds = match Newsfeeds::parse(&text) {
                Ok(f) => f,
                Err(e) => return format!("1 {e}"),
            };
            // Tear down the old sites, then stand up the new set.
            self.site_flush_all();
            for idx in 0..self.sites.len() {
                if let Some(fd) = self.sites[idx].chan_fd.take() {
                    if let Some(ch) = self.chans.take(fd) {
                        self.close_channel(ch);
                    }
                }
                self.procs.unwatch_site(idx);
            }
            self.file_lru.clear();
            self.me = feeds.me;
            self.sites = feeds
                .sites
                .into_iter()
                .map(|s| SiteState::new(s, &self.cfg.outgoing_dir))
                .collect();
            for idx in 0..self.sites.len() {
                self.site_setup(idx);
            }
            self.rebuild_subscriptions();
        }
        if what == "hosts.nntp" || what == "all" {
            match std::fs::read_to_string(&self.cfg.hosts_file) {
                Ok(t) => match HostTable::parse(&t) {
                    Ok(table) => self.hosts = table,
                    Err(e) => return format!("1 {e}"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.hosts = HostTable::default()
                }
                Err(e) => return format!("1 {e}"),
            }
        }
        if what == "active" || what == "all" {
            match active::Active::open(&self.cfg.active_file) {
                Ok(a) => {
                    self.active = a;
                    self.rebuild_subscriptions();
                }
                Err(e) => return format!("1 {e}"),
            }
        }
        "0 ok".to_string()
    }

    // addhist <id> <arrived> <expires|-> <posted> <token>
    fn cc_addhist(&mut self, arg: &str) -> String {
        let fields: Vec<&str> = arg.split_whitespace().collect();
        let [id, arrived, expires, posted, token] = fields.as_slice() else {
            return "1 usage: addhist id arrived expires posted token".to_string();
        };
        if !msgid::id_ok(id) {
            return "1 bad message-id".to_string();
        }
        let hash = msgid::MsgidHash::of(id);
        if self.history.have(hash) {
            return "1 already in history".to_string();
        }
        let arrived: i64 = match arrived.parse() {
            Ok(t) => t,
            Err(_) => return "1 bad arrived time".to_string(),
        };
        let expires = match *expires {
            "-" | "0" => None,
            text => match text.parse() {
                Ok(t) => Some(t),
                Err(_) => return "1 bad expires time".to_string(),
            },
        };
        let posted: i64 = match posted.parse() {
            Ok(t) => t,
            Err(_) => return "1 bad posted time".to_string(),
        };
        let token = match storage::Token::from_text(token) {
            Ok(t) => t,
            Err(e) => return format!("1 {e}"),
        };
        match self.history.write(hash, arrived, posted, expires, token) {
            Ok(()) => "0 ok".to_string(),
            Err(e) => format!("1 {e}"),
        }
    }

    fn cc_renumber(&mut self, arg: &str) -> String {
        let indexes: Vec<usize> = if arg.is_empty() || arg == "all" {
            (0..self.active.len()).collect()
        } else {
            match self.active.find(arg) {
                Some(idx) => vec![idx],
                None => return format!("1 no such group {arg}"),
            }
        };
        for idx in indexes {
            let name = self.active.group(idx).name.clone();
            let stats = match self.overview.group_stats(&name) {
                Ok(stats) => stats.map(|(lo, hi, n)| (lo as u64, hi as u64, n)),
                Err(e) => return format!("1 {e}"),
            };
            if let Err(e) = self.active.renumber(idx, stats) {
                return format!("1 {e}");
            }
        }
        match self.active.flush() {
            Ok(()) => "0 ok".to_string(),
            Err(e) => format!("1 {e}"),
        }
    }
}

fn nonempty(arg: &str, default: &str) -> String {
    if arg.is_empty() { default.to_string() } else { arg.to_string() }
}

fn parse_flag(text: &str) -> active::GroupFlag {
    match text.chars().next() {
        Some('n') => active::GroupFlag::NoPosting,
        Some('m') => active::GroupFlag::Moderated,
        Some('j') => active::GroupFlag::Junked,
        Some('x') => active::GroupFlag::Excluded,
        Some('=') => active::GroupFlag::Alias(text[1..].to_string()),
        _ => active::GroupFlag::Posting,
    }
}

fn sockaddr_un(path: &std::path::Path) -> anyhow::Result<libc::sockaddr_un> {
    use std::os::unix::ffi::OsStrExt;
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        anyhow::bail!("socket path too long: {}", path.display());
    }
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }
    Ok(addr)
}

fn raw(fd: &OwnedFd) -> i32 {
    use std::os::fd::AsRawFd;
    fd.as_raw_fd()
}
