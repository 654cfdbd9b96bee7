//! The remote-connection listener: accept peers, check them against the
//! incoming-host table and the connection limits, and turn survivors into
//! NNTP channels. Unwelcome peers get a short-lived reject channel that
//! exists only to deliver the refusal text.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use socket2::{Domain, Socket, Type};

use crate::chan::{prepare_fd, ChanState, ChanType, Channel};
use crate::server::{Disposition, Server};

impl Server {
    pub fn rc_setup(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.cfg.listen;
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let fd: OwnedFd = socket.into();
        let mut ch = Channel::new(fd, ChanType::RemConn, ChanState::Waiting, self.now);
        ch.hostname = "remconn".to_string();
        let raw = self.insert_channel(ch, true);
        self.remconn_fd = Some(raw);
        tracing::info!(%addr, "listening for peers");
        Ok(())
    }

    /// Accept one pending connection.
    pub fn rc_reader(&mut self, ch: &mut Channel) -> Disposition {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                ch.raw(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                tracing::error!(error = %err, "cant accept");
            }
            return Disposition::Keep;
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let host = peer_text(&storage);

        // Peers must appear in the host table when one is configured.
        let entry = self.hosts.find(&host);
        if entry.is_none() && !self.hosts.hosts.is_empty() {
            tracing::info!(host = %host, "refused connection");
            self.rc_reject(fd, &host, "502 You are not in my access file. Goodbye.");
            return Disposition::Keep;
        }
        let needs_auth = entry.map(|e| !e.password.is_empty()).unwrap_or(false);
        let streaming = self.hosts.may_stream(&host);

        // The connection-rate limiter, unless the peer is exempt.
        let window = self.cfg.remote_timer.as_secs() as i64;
        if window > 0 && self.nolimit.find(&host).is_none() {
            let now = self.now;
            self.conn_window.retain(|(_, t)| now - t < window);
            let from_host = self.conn_window.iter().filter(|(h, _)| h == &host).count();
            if from_host >= self.cfg.remote_limit {
                tracing::info!(host = %host, "too many connects");
                self.rc_reject(fd, &host, "505 Too many connections from your host");
                return Disposition::Keep;
            }
            if self.conn_window.len() >= self.cfg.remote_total {
                self.rc_reject(fd, &host, "505 Too many connections");
                return Disposition::Keep;
            }
            self.conn_window.push((host.clone(), now));
        }

        if let Some(raw) = self.nc_create(fd, host.clone(), streaming, needs_auth, false) {
            tracing::info!(host = %host, fd = raw, streaming, "connected");
        }
        Disposition::Keep
    }

    // A channel whose whole life is delivering one refusal line.
    fn rc_reject(&mut self, fd: OwnedFd, host: &str, text: &str) {
        let _ = prepare_fd(fd.as_raw_fd());
        let mut ch = Channel::new(fd, ChanType::Reject, ChanState::WriteGoodbye, self.now);
        ch.hostname = host.to_string();
        ch.rejected = 1;
        ch.out_buf.append(text.as_bytes());
        ch.out_buf.append(b"\r\n");
        ch.writing = true;
        ch.reading = true;
        self.insert_channel(ch, true);
    }
}

fn peer_text(storage: &libc::sockaddr_storage) -> String {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)).to_string()
        }
        libc::AF_INET6 => {
            let addr = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr).to_string()
        }
        _ => "unknown".to_string(),
    }
}
