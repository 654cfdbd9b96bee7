//! I/O channels: per-descriptor state for everything the reactor drives.
//! A channel owns its descriptor, its input and output buffers, and the
//! counters the checkpoint logs report. The table is indexed by raw fd
//! and a closed channel's slot is reused by the next descriptor with the
//! same number.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use msgid::MsgidHash;

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanType {
    RemConn,
    Reject,
    Nntp,
    LocalConn,
    Control,
    File,
    Exploder,
    Process,
}

/// NNTP receiver state; other channel types sit in Waiting or Writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanState {
    Waiting,
    GetCmd,
    GetAuth,
    GetArticle,
    EatArticle,
    EatCommand,
    GetXBatch,
    WriteGoodbye,
    Writing,
    Paused,
}

/// Why a sleeping channel wants to be woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Retry registering for writable events after a blocked write.
    WriteRetry,
    /// Retry opening a spooling site's real sink.
    SpoolRetry(usize),
    /// The server was paused mid-article; reprocess the input buffer.
    PausedArticle,
}

#[derive(Debug)]
pub struct Channel {
    pub fd: OwnedFd,
    pub ctype: ChanType,
    pub state: ChanState,
    pub hostname: String,

    pub in_buf: Buffer,
    pub out_buf: Buffer,
    /// Pending-offset already scanned for a terminator.
    pub scanned: usize,

    pub reading: bool,
    pub writing: bool,
    pub waketime: Option<i64>,
    pub wake: Option<Wake>,

    pub streaming: bool,
    pub mode_cancel: bool,
    pub is_local: bool,
    /// Preallocated streaming reply (`<code> <id>`); the ACK patches the
    /// first three digits in place.
    pub sendid: String,
    pub cur_hash: MsgidHash,
    pub xbatch_size: usize,
    /// Bytes discarded while eating an oversized article or command.
    pub eaten: usize,

    pub started: i64,
    pub last_active: i64,
    pub next_log: i64,
    pub trace: bool,

    pub bad_reads: u32,
    pub bad_writes: u32,
    pub blocked_writes: u32,
    pub bad_commands: u32,

    pub received: u64,
    pub refused: u64,
    pub rejected: u64,
    pub duplicate: u64,
    pub size: u64,
    pub duplicate_size: u64,
    pub unwanted_site: u64,
    pub unwanted_filter: u64,
    pub unwanted_dist: u64,
    pub unwanted_group: u64,
    pub unwanted_unapproved: u64,
    pub unwanted_other: u64,
    pub reported: u64,
}

impl Channel {
    pub fn new(fd: OwnedFd, ctype: ChanType, state: ChanState, now: i64) -> Channel {
        Channel {
            fd,
            ctype,
            state,
            hostname: String::new(),
            in_buf: Buffer::new(),
            out_buf: Buffer::new(),
            scanned: 0,
            reading: false,
            writing: false,
            waketime: None,
            wake: None,
            streaming: false,
            mode_cancel: false,
            is_local: false,
            sendid: String::new(),
            cur_hash: MsgidHash::default(),
            xbatch_size: 0,
            eaten: 0,
            started: now,
            last_active: now,
            next_log: 0,
            trace: false,
            bad_reads: 0,
            bad_writes: 0,
            blocked_writes: 0,
            bad_commands: 0,
            received: 0,
            refused: 0,
            rejected: 0,
            duplicate: 0,
            size: 0,
            duplicate_size: 0,
            unwanted_site: 0,
            unwanted_filter: 0,
            unwanted_dist: 0,
            unwanted_group: 0,
            unwanted_unapproved: 0,
            unwanted_other: 0,
            reported: 0,
        }
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Printable name for logs.
    pub fn name(&self) -> String {
        match self.ctype {
            ChanType::RemConn => format!("remconn:{}", self.raw()),
            ChanType::Reject => format!("{} rejected", self.hostname),
            ChanType::Nntp => format!("{}:{}", self.hostname, self.raw()),
            ChanType::LocalConn => format!("localconn:{}", self.raw()),
            ChanType::Control => format!("control:{}", self.raw()),
            ChanType::File => format!("{}:{}:file", self.hostname, self.raw()),
            ChanType::Exploder | ChanType::Process => {
                format!("{}:{}:proc", self.hostname, self.raw())
            }
        }
    }

    pub fn sleep_until(&mut self, when: i64, wake: Wake) {
        self.waketime = Some(when);
        self.wake = Some(wake);
    }

    pub fn stop_sleeping(&mut self) {
        self.waketime = None;
        self.wake = None;
    }
}

/// Set the descriptor non-blocking and close-on-exec.
pub fn prepare_fd(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let fdflags = libc::fcntl(fd, libc::F_GETFD);
        if fdflags < 0 || libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Write with EINTR retry, falling back to chunked writes when the kernel
/// balks at the full length.
pub fn chan_write(fd: RawFd, data: &[u8]) -> std::io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EMSGSIZE) => break,
            _ => return Err(err),
        }
    }

    // EMSGSIZE: write in pieces.
    const CHUNK: usize = 8192;
    let mut total = 0usize;
    for piece in data.chunks(CHUNK) {
        let n = unsafe { libc::write(fd, piece.as_ptr().cast(), piece.len()) };
        if n <= 0 {
            if total > 0 {
                return Ok(total);
            }
            return Err(std::io::Error::last_os_error());
        }
        total += n as usize;
        if (n as usize) < piece.len() {
            break;
        }
    }
    Ok(total)
}

pub fn chan_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// The channel table, indexed by raw descriptor.
#[derive(Debug, Default)]
pub struct ChannelTable {
    slots: Vec<Option<Channel>>,
}

impl ChannelTable {
    pub fn new() -> ChannelTable {
        ChannelTable::default()
    }

    pub fn insert(&mut self, ch: Channel) -> RawFd {
        let fd = ch.raw();
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        debug_assert!(self.slots[idx].is_none(), "fd {fd} already has a channel");
        self.slots[idx] = Some(ch);
        fd
    }

    pub fn take(&mut self, fd: RawFd) -> Option<Channel> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    pub fn put(&mut self, ch: Channel) {
        let idx = ch.raw() as usize;
        self.slots[idx] = Some(ch);
    }

    pub fn get(&self, fd: RawFd) -> Option<&Channel> {
        self.slots.get(fd as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.slots.get_mut(fd as usize).and_then(Option::as_mut)
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref().map(Channel::raw))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd};

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn table_insert_take_put() {
        let (r, _w) = pipe_fds();
        let raw = r.as_raw_fd();
        let mut table = ChannelTable::new();
        table.insert(Channel::new(r, ChanType::Nntp, ChanState::GetCmd, 0));

        assert!(table.get(raw).is_some());
        let ch = table.take(raw).unwrap();
        assert!(table.get(raw).is_none());
        table.put(ch);
        assert_eq!(table.fds(), vec![raw]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn chan_write_and_read_round_trip() {
        let (r, w) = pipe_fds();
        prepare_fd(r.as_raw_fd()).unwrap();
        prepare_fd(w.as_raw_fd()).unwrap();

        let n = chan_write(w.as_raw_fd(), b"hello").unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        let n = chan_read(r.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Nothing more to read: nonblocking read reports WouldBlock.
        let err = chan_read(r.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
