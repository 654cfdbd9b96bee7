//! The NNTP receiver: per-connection command dispatch and article
//! accumulation, including the streaming CHECK/TAKETHIS pair, the eat
//! states for oversized input, and XBATCH reception.

use std::io::Write;
use std::os::fd::OwnedFd;

use msgid::MsgidHash;
use storage::Spool;

use crate::chan::{chan_read, chan_write, prepare_fd, ChanState, ChanType, Channel, Wake};
use crate::server::{Disposition, Mode, Server};

/// Octets of a command line, terminator included.
const MAX_COMMAND_LEN: usize = 512;
/// Tail bytes kept while eating oversized input, enough to catch a
/// terminator split across reads.
const SAVE_AMT: usize = 10;
/// Per-pass read size: bounds how many streamed CHECKs one channel can
/// burn per reactor cycle.
const READ_CHUNK: usize = 1024;

const TERMINATOR: &[u8] = b"\r\n.\r\n";

impl Server {
    /// Turn an accepted connection into an NNTP channel and greet it.
    pub fn nc_create(
        &mut self,
        fd: OwnedFd,
        hostname: String,
        streaming: bool,
        needs_auth: bool,
        is_local: bool,
    ) -> Option<i32> {
        use std::os::fd::AsRawFd;
        let _ = prepare_fd(fd.as_raw_fd());
        let state = if needs_auth { ChanState::GetAuth } else { ChanState::GetCmd };
        let mut ch = Channel::new(fd, ChanType::Nntp, state, self.now);
        ch.hostname = hostname;
        ch.streaming = streaming;
        ch.is_local = is_local;
        let raw = self.insert_channel(ch, true);

        if let Mode::Throttled(reason) = &self.mode {
            let reason = reason.clone();
            let mut ch = self.chans.take(raw).unwrap();
            self.nc_write_shutdown(&mut ch, &reason);
            self.chans.put(ch);
            return None;
        }
        if !is_local && self.nntp_count > self.cfg.max_connections {
            let mut ch = self.chans.take(raw).unwrap();
            self.nc_write_shutdown(&mut ch, "Too many connections");
            self.chans.put(ch);
            return None;
        }

        let greeting = format!("200 {} InterNetNews server ready", self.cfg.pathhost);
        let mut ch = self.chans.take(raw).unwrap();
        self.nc_reply(&mut ch, &greeting);
        self.chans.put(ch);
        Some(raw)
    }

    /// Read whatever is there and process it.
    pub fn nc_reader(&mut self, ch: &mut Channel) -> Disposition {
        let mut buf = [0u8; READ_CHUNK];
        match chan_read(ch.raw(), &mut buf) {
            Ok(0) => {
                tracing::info!(channel = %ch.name(), "readclose");
                return Disposition::Close;
            }
            Ok(n) => ch.in_buf.append(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Disposition::Keep,
            Err(e) => {
                tracing::error!(channel = %ch.name(), error = %e, "cant read");
                ch.bad_reads += 1;
                if ch.bad_reads >= self.cfg.bad_io_count {
                    return Disposition::Close;
                }
                return Disposition::Keep;
            }
        }
        self.nc_process(ch)
    }

    /// Grind through whatever complete commands and articles sit in the
    /// input buffer.
    pub fn nc_process(&mut self, ch: &mut Channel) -> Disposition {
        loop {
            if ch.state == ChanState::WriteGoodbye || ch.state == ChanState::Paused {
                return Disposition::Keep;
            }
            let progressed = match ch.state {
                ChanState::GetCmd | ChanState::GetAuth => match self.nc_take_line(ch) {
                    LineStep::Line(line) => {
                        let disp = self.nc_dispatch(ch, &line);
                        if disp == Disposition::Close {
                            return Disposition::Close;
                        }
                        true
                    }
                    LineStep::Wait => false,
                },
                ChanState::GetArticle => match self.nc_take_article(ch) {
                    ArticleStep::Complete(wire) => {
                        self.nc_post(ch, &wire);
                        true
                    }
                    ArticleStep::Deferred => return Disposition::Keep,
                    ArticleStep::Wait => false,
                    ArticleStep::Overflow => true,
                },
                ChanState::EatArticle => self.nc_eat_article(ch),
                ChanState::EatCommand => self.nc_eat_command(ch),
                ChanState::GetXBatch => self.nc_take_xbatch(ch),
                _ => false,
            };
            if !progressed {
                return Disposition::Keep;
            }
        }
    }

    // ---- line & article framing -------------------------------------------

    fn nc_take_line(&mut self, ch: &mut Channel) -> LineStep {
        let pending = ch.in_buf.pending();
        let Some(nl) = memchr::memchr(b'\n', pending) else {
            if pending.len() > MAX_COMMAND_LEN {
                ch.eaten = pending.len();
                ch.in_buf.clear();
                ch.state = ChanState::EatCommand;
            }
            return LineStep::Wait;
        };
        let mut line = pending[..nl].to_vec();
        let crlf = line.last() == Some(&b'\r');
        if crlf {
            line.pop();
        }
        ch.in_buf.advance(nl + 1);
        if !crlf && !line.is_empty() {
            // A bare LF mid-stream usually means we lost framing inside
            // an article.
            self.nc_bad_command(ch, &String::from_utf8_lossy(&line));
            return LineStep::Line(String::new());
        }
        LineStep::Line(String::from_utf8_lossy(&line).into_owned())
    }

    fn nc_take_article(&mut self, ch: &mut Channel) -> ArticleStep {
        let pending = ch.in_buf.pending();

        // The null article: a terminator with no content.
        if pending.starts_with(b".\r\n") {
            ch.in_buf.advance(3);
            ch.scanned = 0;
            ch.rejected += 1;
            ch.state = ChanState::GetCmd;
            if !ch.sendid.is_empty() {
                let reply = patch_sendid(ch, 439);
                self.nc_reply(ch, &reply);
            } else {
                self.nc_reply(ch, "437 Empty article");
            }
            self.nc_clear_wip(ch);
            return ArticleStep::Overflow;
        }

        let start = ch.scanned.saturating_sub(TERMINATOR.len() - 1);
        match memchr::memmem::find(&pending[start..], TERMINATOR) {
            Some(i) => {
                let term = start + i;
                if term + 2 > self.cfg.max_art_size {
                    // Arrived whole, but too big to take.
                    ch.in_buf.advance(term + TERMINATOR.len());
                    ch.scanned = 0;
                    ch.state = ChanState::GetCmd;
                    self.nc_reject_oversize(ch, term + 2);
                    return ArticleStep::Overflow;
                }
                if let Mode::Paused(_) = &self.mode {
                    // Hold the complete article until the pause lifts.
                    ch.reading = false;
                    ch.state = ChanState::Paused;
                    let retry = self.cfg.pause_retry_time.as_secs() as i64;
                    ch.sleep_until(self.now + retry, Wake::PausedArticle);
                    return ArticleStep::Deferred;
                }
                // Keep the final CRLF of the last body line, eat the dot.
                let wire = unstuff(&pending[..term + 2]);
                ch.in_buf.advance(term + TERMINATOR.len());
                ch.scanned = 0;
                ch.state = ChanState::GetCmd;
                ArticleStep::Complete(wire)
            }
            None => {
                ch.scanned = pending.len();
                if pending.len() > self.cfg.max_art_size {
                    let keep = pending.len().saturating_sub(SAVE_AMT);
                    ch.eaten = keep;
                    ch.in_buf.advance(keep);
                    ch.scanned = 0;
                    ch.state = ChanState::EatArticle;
                    return ArticleStep::Overflow;
                }
                ArticleStep::Wait
            }
        }
    }

    fn nc_eat_article(&mut self, ch: &mut Channel) -> bool {
        let pending = ch.in_buf.pending();
        match memchr::memmem::find(pending, TERMINATOR) {
            Some(i) => {
                let total = ch.eaten + i + TERMINATOR.len();
                ch.in_buf.advance(i + TERMINATOR.len());
                ch.eaten = 0;
                ch.scanned = 0;
                ch.state = ChanState::GetCmd;
                self.nc_reject_oversize(ch, total);
                true
            }
            None => {
                let keep = pending.len().saturating_sub(SAVE_AMT);
                if keep > 0 {
                    ch.eaten += keep;
                    ch.in_buf.advance(keep);
                }
                false
            }
        }
    }

    // Too big: reply, remember the ID so nobody offers it again, move on.
    fn nc_reject_oversize(&mut self, ch: &mut Channel, size: usize) {
        tracing::info!(
            channel = %ch.name(),
            size,
            limit = self.cfg.max_art_size,
            "rejecting huge article"
        );
        ch.rejected += 1;
        if !ch.sendid.is_empty() {
            let reply = patch_sendid(ch, 439);
            self.nc_reply(ch, &reply);
        } else {
            let reply = format!(
                "437 Article exceeds local limit of {} bytes",
                self.cfg.max_art_size
            );
            self.nc_reply(ch, &reply);
        }
        if !ch.cur_hash.is_empty() && !self.history.have(ch.cur_hash) {
            if let Err(e) = self.history.remember(ch.cur_hash, self.now) {
                tracing::error!(error = %e, "cant write history");
            }
        }
        self.nc_clear_wip(ch);
    }

    fn nc_eat_command(&mut self, ch: &mut Channel) -> bool {
        let pending = ch.in_buf.pending();
        match memchr::memchr(b'\n', pending) {
            Some(i) => {
                let total = ch.eaten + i + 1;
                ch.in_buf.advance(i + 1);
                ch.eaten = 0;
                ch.state = ChanState::GetCmd;
                tracing::info!(channel = %ch.name(), size = total, "rejecting too long command");
                let reply =
                    format!("500 Command exceeds local limit of {MAX_COMMAND_LEN} bytes");
                self.nc_reply(ch, &reply);
                true
            }
            None => {
                ch.eaten += pending.len();
                ch.in_buf.clear();
                false
            }
        }
    }

    fn nc_take_xbatch(&mut self, ch: &mut Channel) -> bool {
        if ch.in_buf.len() < ch.xbatch_size {
            return false;
        }
        let size = ch.xbatch_size;
        let payload = ch.in_buf.pending()[..size].to_vec();
        ch.in_buf.advance(size);
        ch.xbatch_size = 0;
        ch.state = ChanState::GetCmd;

        let tmp = self
            .cfg
            .incoming_dir
            .join(format!("{}{}.tmp", self.now, ch.raw()));
        let dest = tmp.with_extension("x");
        let stored = std::fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(&payload).and(f.sync_data()))
            .and_then(|_| std::fs::rename(&tmp, &dest));
        match stored {
            Ok(()) => {
                tracing::info!(channel = %ch.name(), size, "accepted batch");
                ch.received += 1;
                self.nc_reply(ch, "239 batch transferred ok");
            }
            Err(e) => {
                tracing::error!(channel = %ch.name(), error = %e, "cant store batch");
                ch.rejected += 1;
                let reply = format!("436 cant store batch: {e}");
                self.nc_reply(ch, &reply);
            }
        }
        self.nc_clear_wip(ch);
        true
    }

    // ---- command dispatch -------------------------------------------------

    fn nc_dispatch(&mut self, ch: &mut Channel, line: &str) -> Disposition {
        if line.is_empty() {
            return Disposition::Keep;
        }
        ch.stop_sleeping();
        if ch.trace || self.tracing_all {
            tracing::debug!(channel = %ch.name(), line, "<");
        }

        let (word, arg) = match line.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (line, ""),
        };

        if ch.state == ChanState::GetAuth {
            match word.to_ascii_lowercase().as_str() {
                "authinfo" => self.cmd_authinfo(ch, arg),
                "mode" => self.cmd_mode(ch, arg),
                "quit" => self.cmd_quit(ch),
                _ => self.nc_reply(ch, "480 Authinfo required"),
            }
            return Disposition::Keep;
        }

        if ch.mode_cancel {
            self.cmd_cancel_line(ch, line);
            return Disposition::Keep;
        }

        match word.to_ascii_lowercase().as_str() {
            "ihave" => self.cmd_ihave(ch, arg),
            "check" if self.nc_streaming_ok(ch) => self.cmd_check(ch, arg),
            "takethis" if self.nc_streaming_ok(ch) => self.cmd_takethis(ch, arg),
            "mode" => self.cmd_mode(ch, arg),
            "head" => self.cmd_head_stat(ch, arg, true),
            "stat" => self.cmd_head_stat(ch, arg, false),
            "list" => self.cmd_list(ch, arg),
            "help" => self.cmd_help(ch),
            "xbatch" => self.cmd_xbatch(ch, arg),
            "authinfo" => self.cmd_authinfo(ch, arg),
            "xpath" => self.nc_reply(ch, "500 What?"),
            "quit" => self.cmd_quit(ch),
            // Reader-side commands we know about but do not serve.
            "article" | "body" | "group" | "last" | "newgroups" | "newnews" | "next"
            | "post" | "slave" | "xhdr" => {
                let reply = format!("500 \"{word}\" not implemented; try \"help\"");
                self.nc_reply(ch, &reply);
            }
            _ => {
                self.nc_bad_command(ch, line);
                return Disposition::Keep;
            }
        }
        // The bad-command limit only counts a consecutive run.
        ch.bad_commands = 0;
        Disposition::Keep
    }

    fn nc_streaming_ok(&self, ch: &Channel) -> bool {
        ch.is_local || ch.streaming
    }

    fn nc_bad_command(&mut self, ch: &mut Channel, line: &str) {
        ch.bad_commands += 1;
        tracing::info!(channel = %ch.name(), command = %truncated(line), "bad_command");
        if ch.bad_commands >= self.cfg.bad_command_count {
            ch.state = ChanState::WriteGoodbye;
        }
        self.nc_reply(ch, "500 What?");
    }

    fn cmd_quit(&mut self, ch: &mut Channel) {
        ch.state = ChanState::WriteGoodbye;
        self.nc_reply(ch, "205 Bye!");
    }

    fn cmd_ihave(&mut self, ch: &mut Channel, id: &str) {
        if !msgid::id_ok(id) {
            tracing::info!(channel = %ch.name(), id = %truncated(id), "bad_messageid");
            self.nc_reply(ch, "435 Bad Message-ID");
            return;
        }
        if self.cfg.refuse_cybercancels && id.starts_with("<cancel.") {
            ch.refused += 1;
            self.nc_reply(ch, "435 Duplicate");
            return;
        }
        let hash = MsgidHash::of(id);
        if self.history.have(hash) {
            ch.refused += 1;
            self.nc_reply(ch, "435 Duplicate");
            return;
        }
        if self.wip.in_progress(hash, ch.raw(), false, self.now) {
            if self.cfg.no_resend_id {
                ch.refused += 1;
                self.nc_reply(ch, "435 Duplicate");
            } else {
                self.nc_reply(ch, "436 Retry later");
            }
            return;
        }
        self.wip.claim(hash, ch.raw(), self.now);
        ch.cur_hash = hash;
        ch.sendid.clear();
        ch.scanned = 0;
        ch.state = ChanState::GetArticle;
        self.nc_reply(ch, "335 Send it");
    }

    fn cmd_check(&mut self, ch: &mut Channel, id: &str) {
        if !msgid::id_ok(id) {
            tracing::info!(channel = %ch.name(), id = %truncated(id), "bad_messageid");
            let reply = format!("438 {id}");
            self.nc_reply(ch, &reply);
            return;
        }
        if self.cfg.refuse_cybercancels && id.starts_with("<cancel.") {
            ch.refused += 1;
            let reply = format!("438 {id}");
            self.nc_reply(ch, &reply);
            return;
        }
        let hash = MsgidHash::of(id);
        let reply = if self.history.have(hash) {
            ch.refused += 1;
            format!("438 {id}")
        } else if self.wip.in_progress(hash, ch.raw(), true, self.now) {
            if self.cfg.no_resend_id {
                ch.refused += 1;
                format!("438 {id}")
            } else {
                format!("431 {id}")
            }
        } else {
            ch.cur_hash = hash;
            format!("238 {id}")
        };
        self.nc_reply(ch, &reply);
    }

    fn cmd_takethis(&mut self, ch: &mut Channel, id: &str) {
        if !msgid::id_ok(id) {
            tracing::info!(channel = %ch.name(), id = %truncated(id), "bad_messageid");
        }
        // Preallocate the NAK; acceptance patches the code in place.
        ch.sendid = format!("439 {id}");
        let hash = MsgidHash::of(id);
        if self.wip.holder(hash).is_none() {
            self.wip.claim(hash, ch.raw(), self.now);
        }
        if ch.cur_hash != hash {
            self.wip.free(ch.cur_hash);
        }
        ch.cur_hash = hash;
        ch.scanned = 0;
        ch.state = ChanState::GetArticle;
    }

    fn cmd_mode(&mut self, ch: &mut Channel, arg: &str) {
        if arg.eq_ignore_ascii_case("reader") {
            self.nc_reply(ch, "503 No reader service here");
        } else if arg.eq_ignore_ascii_case("stream") && self.nc_streaming_ok(ch) {
            tracing::info!(channel = %ch.name(), "mode stream received");
            self.nc_reply(ch, "203 StreamOK.");
        } else if arg.eq_ignore_ascii_case("cancel") {
            // Cancels straight off the wire need more trust than a feed.
            let trusted = ch.is_local
                || self
                    .hosts
                    .find(&ch.hostname)
                    .map(|h| !h.password.is_empty())
                    .unwrap_or(false);
            if trusted {
                ch.mode_cancel = true;
                self.nc_reply(ch, "284 Send cancels");
            } else {
                self.nc_reply(ch, "502 Permission denied");
            }
        } else {
            self.nc_reply(ch, "500 What?");
        }
    }

    /// One line of MODE CANCEL input: a message-ID to cancel.
    fn cmd_cancel_line(&mut self, ch: &mut Channel, line: &str) {
        let id = line.trim();
        if !msgid::id_ok(id) {
            self.nc_reply(ch, "484 Syntax error");
            return;
        }
        match self.art_cancel_by_id(id, &ch.hostname.clone(), true) {
            Ok(()) => self.nc_reply(ch, "289 Cancelled"),
            Err(reason) => {
                let reply = format!("484 {reason}");
                self.nc_reply(ch, &reply);
            }
        }
    }

    fn cmd_head_stat(&mut self, ch: &mut Channel, id: &str, head: bool) {
        if !msgid::id_ok(id) {
            self.nc_reply(ch, "501 Bad Message-ID");
            return;
        }
        let hash = MsgidHash::of(id);
        let token = match self.history.token_for(hash) {
            Ok(Some(token)) => token,
            _ => {
                self.nc_reply(ch, "430 Not found");
                return;
            }
        };
        let what = if head { storage::Retrieve::Head } else { storage::Retrieve::Stat };
        match self.spool.retrieve(token, what) {
            Ok(data) if head => {
                ch.out_buf.append(format!("221 0 {id}\r\n").as_bytes());
                ch.out_buf.append(&data);
                if !data.ends_with(b"\r\n") {
                    ch.out_buf.append(b"\r\n");
                }
                self.nc_reply(ch, ".");
            }
            Ok(_) => {
                let reply = format!("223 0 {id}");
                self.nc_reply(ch, &reply);
            }
            Err(_) => self.nc_reply(ch, "430 Not found"),
        }
    }

    fn cmd_list(&mut self, ch: &mut Channel, arg: &str) {
        let body: Vec<u8> = if arg.is_empty() || arg.eq_ignore_ascii_case("active") {
            self.active.image().to_vec()
        } else if arg.eq_ignore_ascii_case("newsgroups") {
            match std::fs::read(&self.cfg.newsgroups_file) {
                Ok(data) => data,
                Err(_) => {
                    self.nc_reply(ch, "215 Newsgroups follow");
                    self.nc_reply(ch, ".");
                    return;
                }
            }
        } else {
            self.nc_reply(ch, "500 What?");
            return;
        };
        ch.out_buf.append(b"215 Newsgroups follow\r\n");
        for line in body.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if line.first() == Some(&b'.') {
                ch.out_buf.append(b".");
            }
            ch.out_buf.append(line);
            ch.out_buf.append(b"\r\n");
        }
        self.nc_reply(ch, ".");
    }

    fn cmd_help(&mut self, ch: &mut Channel) {
        ch.out_buf.append(b"100 Legal commands\r\n");
        let mut commands: Vec<&str> = vec![
            "authinfo", "help", "ihave", "list", "mode", "quit", "head", "stat", "xbatch",
            "xpath",
        ];
        if self.nc_streaming_ok(ch) {
            commands.push("check");
            commands.push("takethis");
        }
        for c in commands {
            ch.out_buf.append(format!("\t{c}\r\n").as_bytes());
        }
        self.nc_reply(ch, ".");
    }

    fn cmd_authinfo(&mut self, ch: &mut Channel, arg: &str) {
        let (sub, value) = match arg.split_once(char::is_whitespace) {
            Some((s, v)) => (s, v.trim()),
            None => (arg, ""),
        };
        if sub.eq_ignore_ascii_case("user") {
            self.nc_reply(ch, "381 PASS required");
            return;
        }
        if !sub.eq_ignore_ascii_case("pass") {
            self.nc_reply(ch, "480 Authinfo required");
            return;
        }
        let authorized = match self.hosts.find(&ch.hostname) {
            Some(h) => h.password.is_empty() || h.password == value,
            None => false,
        };
        if authorized {
            ch.state = ChanState::GetCmd;
            self.nc_reply(ch, "281 Ok");
        } else {
            ch.state = ChanState::WriteGoodbye;
            self.nc_reply(ch, "481 Authentication error");
        }
    }

    fn cmd_xbatch(&mut self, ch: &mut Channel, arg: &str) {
        let size: usize = match arg.parse() {
            Ok(n) if n > 0 && n <= self.cfg.max_art_size => n,
            _ => {
                tracing::info!(channel = %ch.name(), arg, "bad xbatch size");
                self.nc_reply(ch, "500 Bad xbatch size");
                return;
            }
        };
        ch.xbatch_size = size;
        ch.state = ChanState::GetXBatch;
        self.nc_reply(ch, "339 Continue");
    }

    // ---- article hand-off -------------------------------------------------

    /// A complete article arrived; run it through the processor and answer.
    fn nc_post(&mut self, ch: &mut Channel, wire: &[u8]) {
        if let Mode::Throttled(reason) = &self.mode {
            let reason = reason.clone();
            ch.rejected += 1;
            self.nc_write_shutdown(ch, &reason);
            self.nc_clear_wip(ch);
            return;
        }

        let response = self.art_post(ch, wire);
        let accepted = response.starts_with("235");
        let reply = if !ch.sendid.is_empty() {
            patch_sendid(ch, if accepted { 239 } else { 439 })
        } else {
            response.clone()
        };
        if accepted {
            ch.received += 1;
        } else {
            ch.rejected += 1;
        }

        ch.reported += 1;
        if ch.reported >= self.cfg.checkpoint_count {
            tracing::info!(
                channel = %ch.name(),
                seconds = self.now - ch.started,
                accepted = ch.received,
                refused = ch.refused,
                rejected = ch.rejected,
                duplicate = ch.duplicate,
                accepted_size = ch.size,
                duplicate_size = ch.duplicate_size,
                "checkpoint"
            );
            ch.reported = 0;
        }

        if let Mode::Throttled(reason) = &self.mode {
            let reason = reason.clone();
            self.nc_write_shutdown(ch, &reason);
        } else {
            self.nc_reply(ch, &reply);
        }
        self.nc_clear_wip(ch);
    }

    fn nc_clear_wip(&mut self, ch: &mut Channel) {
        self.wip.free(ch.cur_hash);
        ch.cur_hash.clear();
        ch.sendid.clear();
    }

    // ---- replies ----------------------------------------------------------

    /// Queue a reply line; write it out right away when nothing else is
    /// buffered.
    pub fn nc_reply(&mut self, ch: &mut Channel, text: &str) {
        let had_pending = !ch.out_buf.is_empty();
        ch.out_buf.append(text.as_bytes());
        ch.out_buf.append(b"\r\n");
        if ch.trace || self.tracing_all {
            tracing::debug!(channel = %ch.name(), reply = text, ">");
        }
        if !had_pending {
            if let Ok(n) = chan_write(ch.raw(), ch.out_buf.pending()) {
                ch.out_buf.advance(n);
            }
        }
        if !ch.out_buf.is_empty() {
            ch.writing = true;
        }
    }

    /// Tell the peer to go away: stop reading, say goodbye, close once
    /// the text drains.
    pub fn nc_write_shutdown(&mut self, ch: &mut Channel, reason: &str) {
        ch.state = ChanState::WriteGoodbye;
        ch.reading = false;
        let text = format!("400 {reason}");
        self.nc_reply(ch, &text);
    }
}

enum LineStep {
    Line(String),
    Wait,
}

enum ArticleStep {
    Complete(Vec<u8>),
    Overflow,
    Deferred,
    Wait,
}

/// Patch the preallocated `<code> <id>` streaming reply.
fn patch_sendid(ch: &mut Channel, code: u16) -> String {
    let code = code.to_string();
    ch.sendid.replace_range(..3, &code);
    ch.sendid.clone()
}

/// Undo NNTP dot-stuffing: a line starting `..` loses one dot.
fn unstuff(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire.len());
    let mut at_line_start = true;
    let mut i = 0;
    while i < wire.len() {
        if at_line_start && wire[i] == b'.' && wire.get(i + 1) == Some(&b'.') {
            i += 1;
        }
        at_line_start = wire[i] == b'\n';
        out.push(wire[i]);
        i += 1;
    }
    out
}

fn truncated(text: &str) -> String {
    if text.len() > 100 {
        let cut: String = text.chars().take(100).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unstuff_drops_leading_dots() {
        assert_eq!(unstuff(b"..leading\r\nplain\r\n...x\r\n"), b".leading\r\nplain\r\n..x\r\n");
        assert_eq!(unstuff(b"no dots\r\n"), b"no dots\r\n");
        assert_eq!(unstuff(b"a.b..c\r\n"), b"a.b..c\r\n");
    }

    #[test]
    fn sendid_patching() {
        let (r, _w) = {
            let mut fds = [0i32; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            unsafe {
                use std::os::fd::FromRawFd;
                (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
            }
        };
        let mut ch = Channel::new(r, ChanType::Nntp, ChanState::GetCmd, 0);
        ch.sendid = "439 <a@b>".to_string();
        assert_eq!(patch_sendid(&mut ch, 239), "239 <a@b>");
        assert_eq!(ch.sendid, "239 <a@b>");
    }
}
