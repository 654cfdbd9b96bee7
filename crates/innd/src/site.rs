//! Site output disciplines: file appends with LRU buffering, long-lived
//! channel and exploder children, per-article programs, funnels, and the
//! spool fallback that catches everything when a sink goes away.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use newsfeeds::{FeedItem, FeedKind, Site};

use crate::buffer::Buffer;
use crate::chan::{prepare_fd, ChanState, ChanType, Channel, Wake};
use crate::server::Server;

/// Inband control lines to an exploder are prefixed with this byte.
pub const EXPLODER_CONTROL: u8 = b'!';

/// Everything about one accepted article that a feed record might want.
pub struct FeedData<'a> {
    pub token_text: &'a str,
    pub hash_text: &'a str,
    pub size: u64,
    pub msgid: &'a str,
    pub newsgroups: &'a str,
    pub distribution: &'a str,
    pub headers: Option<&'a str>,
    pub overview: Option<&'a str>,
    pub path_value: &'a str,
    pub replic: &'a str,
    pub stored_group: &'a str,
    pub time_received: i64,
    pub posted: i64,
    pub expires: i64,
    pub feedsite: &'a str,
    /// Names of every site receiving this article, for `W*` on
    /// non-funnel sites.
    pub all_names: &'a str,
}

/// Runtime state of one configured feed.
#[derive(Debug)]
pub struct SiteState {
    pub config: Site,
    pub spool_path: PathBuf,
    pub file_path: PathBuf,
    pub chan_fd: Option<RawFd>,
    pub buffered: bool,
    pub buffer: Buffer,
    pub spooling: bool,
    pub working: bool,

    // Per-article scratch, reset before each newsgroup walk.
    pub sendit: bool,
    pub seenit: bool,
    pub poison: bool,
    pub ng: Option<usize>,
    pub fnl_names: String,
}

impl SiteState {
    pub fn new(config: Site, outgoing_dir: &Path) -> SiteState {
        let spool_path = match &config.spool_file {
            Some(name) if Path::new(name).is_absolute() => PathBuf::from(name),
            Some(name) => outgoing_dir.join(name),
            None => outgoing_dir.join(&config.name),
        };
        let file_path = if config.param.is_empty() {
            outgoing_dir.join(&config.name)
        } else if Path::new(&config.param).is_absolute() {
            PathBuf::from(&config.param)
        } else {
            outgoing_dir.join(&config.param)
        };
        SiteState {
            config,
            spool_path,
            file_path,
            chan_fd: None,
            buffered: false,
            buffer: Buffer::new(),
            spooling: false,
            working: false,
            sendit: false,
            seenit: false,
            poison: false,
            ng: None,
            fnl_names: String::new(),
        }
    }

    pub fn reset_scratch(&mut self) {
        self.sendit = false;
        self.seenit = false;
        self.poison = false;
        self.ng = None;
        self.fnl_names.clear();
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

// The spool file: `<spool_path>`, or `<spool_path>/togo` when the
// configured name is a directory.
fn spool_file_path(base: &Path) -> PathBuf {
    if base.is_dir() {
        base.join("togo")
    } else {
        base.to_path_buf()
    }
}

impl Server {
    /// Mark a site (and its funnel target) as getting the current article.
    pub fn site_mark(&mut self, idx: usize, group: Option<usize>) {
        let funnel = {
            let site = &mut self.sites[idx];
            site.sendit = true;
            if site.ng.is_none() {
                site.ng = group;
            }
            site.config.funnel
        };
        if let Some(f) = funnel {
            if self.sites[f].ng.is_none() {
                self.sites[f].ng = group;
            }
        }
    }

    /// Open a site's sink: a file (subject to the descriptor budget) or a
    /// spawned child for channel/exploder feeds.
    pub fn site_setup(&mut self, idx: usize) -> bool {
        let kind = self.sites[idx].config.kind;
        let ok = match kind {
            FeedKind::Funnel | FeedKind::LogOnly | FeedKind::Program => true,
            FeedKind::File => self.site_setup_file(idx),
            FeedKind::Channel | FeedKind::Exploder => self.site_start_process(idx),
        };
        self.sites[idx].working = ok;
        ok
    }

    fn site_setup_file(&mut self, idx: usize) -> bool {
        if self.file_lru.len() >= self.cfg.max_outgoing {
            self.site_buffer(idx);
            return true;
        }
        let path = self.sites[idx].file_path.clone();
        let file = match open_append(&path) {
            Ok(f) => f,
            Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                tracing::error!(site = %self.sites[idx].config.name, error = %e, "cant open");
                self.site_buffer(idx);
                return true;
            }
            Err(e) => {
                tracing::error!(site = %self.sites[idx].config.name, path = %path.display(), error = %e, "cant open");
                self.io_error("site file", &e);
                return false;
            }
        };
        let fd: OwnedFd = file.into();
        let _ = prepare_fd(fd.as_raw_fd());
        let mut ch = Channel::new(fd, ChanType::File, ChanState::Writing, self.now);
        ch.hostname = self.sites[idx].config.name.clone();
        let raw = self.insert_channel(ch, false);
        self.sites[idx].buffered = false;
        self.sites[idx].chan_fd = Some(raw);
        self.sites[idx].spooling = false;
        self.file_lru.retain(|&s| s != idx);
        self.file_lru.insert(0, idx);
        tracing::info!(site = %self.sites[idx].config.name, fd = raw, "opened");
        true
    }

    fn site_start_process(&mut self, idx: usize) -> bool {
        let (name, param, kind) = {
            let s = &self.sites[idx];
            (s.config.name.clone(), s.config.param.clone(), s.config.kind)
        };
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&param).stdin(Stdio::piped());
        match cmd.spawn() {
            Ok(mut child) => {
                let stdin = child.stdin.take().expect("piped stdin");
                let raw = stdin.into_raw_fd();
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                let _ = prepare_fd(raw);
                let ctype = if kind == FeedKind::Exploder {
                    ChanType::Exploder
                } else {
                    ChanType::Process
                };
                let mut ch = Channel::new(fd, ctype, ChanState::Writing, self.now);
                ch.hostname = name.clone();
                let raw = self.insert_channel(ch, false);
                self.procs.watch(child, Some(idx), self.now);
                self.sites[idx].chan_fd = Some(raw);
                self.sites[idx].spooling = false;
                tracing::info!(site = %name, fd = raw, "spawned");
                true
            }
            Err(e) => {
                tracing::error!(site = %name, error = %e, "cant spawn, spooling");
                self.site_spool(idx)
            }
        }
    }

    /// Switch a site to in-memory buffered mode.
    fn site_buffer(&mut self, idx: usize) {
        self.file_lru.retain(|&s| s != idx);
        if let Some(fd) = self.sites[idx].chan_fd.take() {
            if let Some(ch) = self.chans.take(fd) {
                self.close_channel(ch);
            }
        }
        self.sites[idx].buffered = true;
        tracing::info!(site = %self.sites[idx].config.name, "buffered");
    }

    /// Find the least-recently-used open file site and buffer it.
    fn site_buffer_oldest(&mut self) {
        let Some(&oldest) = self.file_lru.last() else { return };
        if let Some(fd) = self.sites[oldest].chan_fd {
            self.site_drain_channel(fd);
            let mut leftover = Buffer::new();
            if let Some(ch) = self.chans.get_mut(fd) {
                leftover.take_from(&mut ch.out_buf);
            }
            self.sites[oldest].buffer.take_from(&mut leftover);
        }
        self.site_buffer(oldest);
    }

    // Blocking best-effort drain of a channel's pending output.
    fn site_drain_channel(&mut self, fd: RawFd) {
        let Some(ch) = self.chans.get_mut(fd) else { return };
        while !ch.out_buf.is_empty() {
            match crate::chan::chan_write(fd, ch.out_buf.pending()) {
                Ok(0) => break,
                Ok(n) => ch.out_buf.advance(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::error!(fd, error = %e, "cant flush");
                    break;
                }
            }
        }
        ch.writing = !ch.out_buf.is_empty();
    }

    /// Start spooling: the site's channel becomes an append channel on
    /// its spool file, retried later.
    pub fn site_spool(&mut self, idx: usize) -> bool {
        let path = spool_file_path(&self.sites[idx].spool_path);
        let file = match open_append(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(site = %self.sites[idx].config.name, path = %path.display(), error = %e, "cant open spool");
                self.io_error("site batch file", &e);
                self.sites[idx].chan_fd = None;
                return false;
            }
        };
        let fd: OwnedFd = file.into();
        let _ = prepare_fd(fd.as_raw_fd());
        let mut ch = Channel::new(fd, ChanType::File, ChanState::Writing, self.now);
        ch.hostname = self.sites[idx].config.name.clone();
        ch.sleep_until(
            self.now + self.cfg.chan_retry_time.as_secs() as i64,
            Wake::SpoolRetry(idx),
        );
        let raw = self.insert_channel(ch, false);
        self.sites[idx].chan_fd = Some(raw);
        self.sites[idx].spooling = true;
        true
    }

    /// A channel owned by a site just died; spool its pending output and
    /// schedule a retry.
    pub fn site_chan_close(&mut self, mut ch: Channel) {
        let raw = ch.raw();
        let Some(idx) = self.sites.iter().position(|s| s.chan_fd == Some(raw)) else {
            self.close_channel(ch);
            return;
        };
        self.sites[idx].chan_fd = None;
        self.file_lru.retain(|&s| s != idx);
        let lost = ch.out_buf.len();
        if !self.site_spool(idx) {
            tracing::error!(site = %self.sites[idx].config.name, lost, "loss");
            self.close_channel(ch);
            return;
        }
        if let Some(new_fd) = self.sites[idx].chan_fd {
            let spool_ch = self.chans.get_mut(new_fd).unwrap();
            spool_ch.out_buf.take_from(&mut ch.out_buf);
            spool_ch.writing = !spool_ch.out_buf.is_empty();
        }
        self.close_channel(ch);
    }

    /// The retry timer on a spooling site fired: flush the spool channel
    /// and try to bring the real sink back.
    pub fn site_spool_wake(&mut self, idx: usize, fd: RawFd) {
        if self.sites[idx].chan_fd != Some(fd) {
            tracing::error!(site = %self.sites[idx].config.name, fd, "stale spool wake");
            return;
        }
        tracing::info!(site = %self.sites[idx].config.name, "spoolwake");
        self.site_flush(idx, true);
    }

    /// A site's child died; respawn its sink.
    pub fn site_proc_died(&mut self, idx: usize) {
        if idx >= self.sites.len() || !self.sites[idx].working {
            return;
        }
        if let Some(fd) = self.sites[idx].chan_fd.take() {
            if let Some(ch) = self.chans.take(fd) {
                // Pending bytes move to the spool via the close path.
                if !ch.out_buf.is_empty() {
                    self.sites[idx].chan_fd = Some(fd);
                    self.site_chan_close(ch);
                    return;
                }
                self.close_channel(ch);
            }
        }
        if self.site_setup(idx) {
            tracing::info!(site = %self.sites[idx].config.name, "restarted");
        } else {
            tracing::error!(site = %self.sites[idx].config.name, "cant restart");
        }
    }

    /// Append one article record to a site per its `W` flags.
    pub fn site_send(&mut self, idx: usize, data: &FeedData) {
        match self.sites[idx].config.kind {
            FeedKind::LogOnly => return,
            FeedKind::Funnel => {
                tracing::error!(site = %self.sites[idx].config.name, "funnel_send");
                return;
            }
            FeedKind::Program => {
                self.site_send_program(idx, data);
                return;
            }
            FeedKind::File | FeedKind::Channel | FeedKind::Exploder => {}
        }

        let ng_name = self.sites[idx]
            .ng
            .map(|g| self.active.group(g).name.clone())
            .unwrap_or_else(|| "?".to_string());
        let record = build_record(&self.sites[idx], data, &ng_name);
        if record.is_empty() {
            return;
        }
        self.site_append(idx, &record);
    }

    fn site_append(&mut self, idx: usize, record: &[u8]) {
        if self.sites[idx].buffered {
            self.sites[idx].buffer.append(record);
        } else {
            let Some(fd) = self.sites[idx].chan_fd else {
                // Sink never came up; already logged.
                return;
            };
            let Some(ch) = self.chans.get_mut(fd) else { return };
            ch.out_buf.append(record);
            ch.last_active = self.now;
        }
        self.site_flush_check(idx);
    }

    /// Post-append bookkeeping: unbuffer at the flushpoint, apply the
    /// write-registration hysteresis, and fall over to the spool when a
    /// channel backs up past its limit.
    fn site_flush_check(&mut self, idx: usize) {
        if self.sites[idx].buffered {
            if self.sites[idx].buffer.len() < self.sites[idx].config.flush_point {
                return;
            }
            while self.file_lru.len() >= self.cfg.max_outgoing {
                self.site_buffer_oldest();
            }
            if !self.site_setup(idx) || self.sites[idx].buffered {
                tracing::error!(site = %self.sites[idx].config.name, "cant unbuffer");
                return;
            }
            if let Some(fd) = self.sites[idx].chan_fd {
                let mut moved = Buffer::new();
                moved.take_from(&mut self.sites[idx].buffer);
                let ch = self.chans.get_mut(fd).unwrap();
                ch.out_buf.take_from(&mut moved);
                ch.writing = true;
            }
        }

        let Some(fd) = self.sites[idx].chan_fd else { return };
        let (kind, start, stop, spool_at) = {
            let c = &self.sites[idx].config;
            (c.kind, c.start_writing, c.stop_writing, c.start_spooling)
        };

        // Channel feeds try the write right away.
        if kind == FeedKind::Channel || kind == FeedKind::Exploder {
            self.site_drain_channel(fd);
        }

        let Some(ch) = self.chans.get_mut(fd) else { return };
        let pending = ch.out_buf.len();
        if pending < stop {
            ch.writing = false;
        }
        if (start == 0 || pending > start) && ch.waketime.is_none() {
            ch.writing = !ch.out_buf.is_empty();
        }

        // A non-file channel backing up past its threshold bilges to the
        // spool file.
        if kind != FeedKind::File && spool_at != 0 && pending >= spool_at {
            tracing::error!(site = %self.sites[idx].config.name, bytes = pending, "spooling");
            self.site_bilge(idx, fd);
        }
    }

    // Dump a backed-up channel's buffer into the spool file.
    fn site_bilge(&mut self, idx: usize, fd: RawFd) {
        let path = spool_file_path(&self.sites[idx].spool_path);
        let mut file = match open_append(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(site = %self.sites[idx].config.name, error = %e, "overflow");
                self.io_error("site batch file", &e);
                return;
            }
        };
        let Some(ch) = self.chans.get_mut(fd) else { return };
        if let Err(e) = file.write_all(ch.out_buf.pending()) {
            tracing::error!(site = %self.sites[idx].config.name, error = %e, "cant spool");
            return;
        }
        ch.out_buf.clear();
        ch.writing = false;
    }

    fn site_send_program(&mut self, idx: usize, data: &FeedData) {
        let param = self.sites[idx].config.param.clone();
        let fnl = self.sites[idx].fnl_names.clone();
        let mut command = if self.sites[idx].config.fnl_wants_names {
            param.replacen('*', &fnl, 1)
        } else {
            param
        };
        if command.contains("%s") {
            command = command.replacen("%s", data.token_text, 1);
        } else {
            command.push(' ');
            command.push_str(data.token_text);
        }
        match Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => self.procs.watch(child, None, self.now),
            Err(e) => {
                tracing::error!(site = %self.sites[idx].config.name, error = %e, "cant spawn")
            }
        }
    }

    /// Send a control line to an exploder (or the exploder a funnel
    /// points at).
    pub fn site_forward(&mut self, idx: usize, text: &str) {
        let target = self.sites[idx].config.funnel.unwrap_or(idx);
        if self.sites[target].config.kind != FeedKind::Exploder {
            return;
        }
        let mut line = text.to_string();
        if target != idx && self.sites[target].config.fnl_wants_names {
            line.push(' ');
            line.push_str(&self.sites[idx].config.name);
        }
        let mut record = Vec::with_capacity(line.len() + 2);
        record.push(EXPLODER_CONTROL);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');
        self.site_append(target, &record);
    }

    /// Flush a site's pending data; with `restart`, reopen its sink.
    pub fn site_flush(&mut self, idx: usize, restart: bool) {
        let kind = self.sites[idx].config.kind;
        if restart {
            self.site_forward(idx, "flush");
        }
        match kind {
            FeedKind::LogOnly | FeedKind::Program | FeedKind::Funnel => return,
            _ => {}
        }

        // Unbuffer a buffered file site long enough to flush it: hide the
        // descriptor budget for a moment so the open is allowed.
        if kind == FeedKind::File && self.sites[idx].buffered {
            let saved = std::mem::take(&mut self.file_lru);
            let ok = self.site_setup(idx) && !self.sites[idx].buffered;
            let mut restored = std::mem::take(&mut self.file_lru);
            for s in saved {
                if !restored.contains(&s) {
                    restored.push(s);
                }
            }
            self.file_lru = restored;
            if !ok {
                tracing::error!(site = %self.sites[idx].config.name, "cant unbuffer to flush");
            } else if let Some(fd) = self.sites[idx].chan_fd {
                let mut moved = Buffer::new();
                moved.take_from(&mut self.sites[idx].buffer);
                self.chans.get_mut(fd).unwrap().out_buf.take_from(&mut moved);
            }
        }

        let Some(fd) = self.sites[idx].chan_fd else { return };
        self.site_drain_channel(fd);

        let leftover = self.chans.get(fd).map(|c| c.out_buf.len()).unwrap_or(0);
        if !restart && leftover > 0 && kind != FeedKind::File && !self.sites[idx].spooling {
            // A working channel that won't drain: spool and retry.
            if let Some(ch) = self.chans.take(fd) {
                self.site_chan_close(ch);
            }
            return;
        }

        // Close the old sink and reopen it.
        self.sites[idx].chan_fd = None;
        self.file_lru.retain(|&s| s != idx);
        let old = self.chans.take(fd);
        let mut carried = Buffer::new();
        if let Some(mut ch) = old {
            carried.take_from(&mut ch.out_buf);
            self.close_channel(ch);
        }
        self.sites[idx].spooling = false;
        if restart {
            if !self.site_setup(idx) {
                tracing::error!(site = %self.sites[idx].config.name, "cant restart");
                return;
            }
            if carried.is_empty() {
                return;
            }
            if self.sites[idx].buffered {
                self.sites[idx].buffer.take_from(&mut carried);
            } else if let Some(new_fd) = self.sites[idx].chan_fd {
                let ch = self.chans.get_mut(new_fd).unwrap();
                ch.out_buf.take_from(&mut carried);
                ch.writing = true;
            }
        } else if !carried.is_empty() {
            tracing::error!(site = %self.sites[idx].config.name, lost = carried.len(), "dataloss");
        }
    }

    pub fn site_flush_all(&mut self) {
        for idx in 0..self.sites.len() {
            self.site_flush(idx, false);
        }
    }
}

// Render one record from the site's W flags.
fn build_record(site: &SiteState, data: &FeedData, ng_name: &str) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    let mut dirty = false;
    for item in &site.config.file_flags {
        // The headers block gets a line of its own, not a field separator.
        if *item == FeedItem::Headers {
            if dirty {
                out.push(b'\n');
            }
            out.extend_from_slice(data.headers.unwrap_or("").as_bytes());
            dirty = true;
            continue;
        }
        let piece: String = match item {
            FeedItem::Bytesize => data.size.to_string(),
            FeedItem::FullName | FeedItem::Name => data.token_text.to_string(),
            FeedItem::Hash => format!("[{}]", data.hash_text),
            FeedItem::DistHeader => data.distribution.to_string(),
            FeedItem::GroupsHeader => data.newsgroups.to_string(),
            FeedItem::Overview => data.overview.unwrap_or("").to_string(),
            FeedItem::Path => data.path_value.to_string(),
            FeedItem::Replic => data.replic.to_string(),
            FeedItem::StoredGroup => data.stored_group.to_string(),
            FeedItem::TimeReceived => data.time_received.to_string(),
            FeedItem::TimePosted => data.posted.to_string(),
            FeedItem::TimeExpired => data.expires.to_string(),
            FeedItem::MessageId => data.msgid.to_string(),
            FeedItem::FunnelNames if !site.fnl_names.is_empty() => site.fnl_names.clone(),
            FeedItem::FunnelNames => data.all_names.to_string(),
            FeedItem::Newsgroup => ng_name.to_string(),
            FeedItem::Site => data.feedsite.to_string(),
            FeedItem::Headers => unreachable!(),
        };
        if dirty {
            out.push(b' ');
        }
        out.extend_from_slice(piece.as_bytes());
        dirty = true;
    }
    if dirty {
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn site_with_flags(flags: &[FeedItem]) -> SiteState {
        let mut config = Site::default();
        config.name = "test".to_string();
        config.file_flags = flags.to_vec();
        SiteState::new(config, Path::new("/tmp/outgoing"))
    }

    fn data<'a>() -> FeedData<'a> {
        FeedData {
            token_text: "@0100000007000000000000@",
            hash_text: "00112233445566778899AABBCCDDEEFF",
            size: 1234,
            msgid: "<a@b>",
            newsgroups: "misc.test,rec.arts",
            distribution: "world",
            headers: None,
            overview: Some("subject\tposter"),
            path_value: "me!peer!not-for-mail",
            replic: "misc.test:4",
            stored_group: "misc.test",
            time_received: 1000,
            posted: 900,
            expires: 0,
            feedsite: "peer.example",
            all_names: "alpha beta",
        }
    }

    #[test]
    fn record_follows_flags() {
        let site = site_with_flags(&[FeedItem::Name, FeedItem::MessageId]);
        let rec = build_record(&site, &data(), "misc.test");
        assert_eq!(rec, b"@0100000007000000000000@ <a@b>\n");
    }

    #[test]
    fn record_with_hash_and_sizes() {
        let site = site_with_flags(&[FeedItem::Bytesize, FeedItem::Hash, FeedItem::Site]);
        let rec = build_record(&site, &data(), "misc.test");
        assert_eq!(
            rec,
            b"1234 [00112233445566778899AABBCCDDEEFF] peer.example\n".as_slice()
        );
    }

    #[test]
    fn funnel_names_fall_back_to_all_names() {
        let site = site_with_flags(&[FeedItem::FunnelNames]);
        let rec = build_record(&site, &data(), "?");
        assert_eq!(rec, b"alpha beta\n");

        let mut site = site_with_flags(&[FeedItem::FunnelNames]);
        site.fnl_names = "gamma".to_string();
        let rec = build_record(&site, &data(), "?");
        assert_eq!(rec, b"gamma\n");
    }

    #[test]
    fn spool_path_resolution() {
        let mut config = Site::default();
        config.name = "peer".to_string();
        let s = SiteState::new(config.clone(), Path::new("/out"));
        assert_eq!(s.spool_path, PathBuf::from("/out/peer"));

        config.spool_file = Some("/abs/togo".to_string());
        let s = SiteState::new(config.clone(), Path::new("/out"));
        assert_eq!(s.spool_path, PathBuf::from("/abs/togo"));

        config.spool_file = Some("rel".to_string());
        let s = SiteState::new(config, Path::new("/out"));
        assert_eq!(s.spool_path, PathBuf::from("/out/rel"));
    }
}
