//! The local-connection listener: a Unix-domain stream socket under the
//! run directory that local feeders (rnews and friends) connect to. The
//! connections speak ordinary NNTP but skip auth and the connection caps.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixListener;

use anyhow::Context;

use crate::chan::{ChanState, ChanType, Channel};
use crate::server::{Disposition, Server};

impl Server {
    pub fn lc_setup(&mut self) -> anyhow::Result<()> {
        let path = self.cfg.local_socket();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("unlinking stale local socket"),
        }
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("binding {}", path.display()))?;
        listener.set_nonblocking(true)?;

        let fd: OwnedFd = listener.into();
        let mut ch = Channel::new(fd, ChanType::LocalConn, ChanState::Waiting, self.now);
        ch.hostname = "localconn".to_string();
        let raw = self.insert_channel(ch, true);
        self.localconn_fd = Some(raw);
        tracing::info!(path = %path.display(), "listening for local feeders");
        Ok(())
    }

    pub fn lc_reader(&mut self, ch: &mut Channel) -> Disposition {
        let fd = unsafe { libc::accept(ch.raw(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                tracing::error!(error = %err, "cant accept local connection");
            }
            return Disposition::Keep;
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if let Some(raw) = self.nc_create(fd, "localhost".to_string(), true, false, true) {
            tracing::info!(fd = raw, "localhost connected");
        }
        Disposition::Keep
    }
}
