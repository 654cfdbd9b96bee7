//! End-to-end exercises of the receive → process → file → feed pipeline,
//! driven through the NNTP state machine with pipe-backed channels.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use clap::Parser;
use msgid::MsgidHash;

use crate::chan::{chan_read, prepare_fd, ChanState, ChanType, Channel};
use crate::config::Config;
use crate::server::{Disposition, Mode, Server};

fn test_server(extra_args: &[&str]) -> (tempfile::TempDir, Server) {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path();
    std::fs::create_dir_all(p.join("db")).unwrap();
    std::fs::create_dir_all(p.join("etc")).unwrap();
    std::fs::write(
        p.join("db/active"),
        "misc.test 0000000000 0000000001 y\n\
         rec.arts 0000000000 0000000001 y\n\
         news.admin.peering 0000000010 0000000001 y\n\
         comp.lang.c 0000000900 0000000001 y\n\
         old.name 0000000000 0000000001 =misc.test\n\
         control 0000000000 0000000001 n\n\
         control.cancel 0000000000 0000000001 n\n\
         junk 0000000000 0000000001 y\n",
    )
    .unwrap();
    std::fs::write(p.join("etc/newsfeeds"), "ME:*::\n\nfull:*:Tf,Wnm:\n").unwrap();

    let path = |s: &str| p.join(s).to_str().unwrap().to_string();
    let mut args: Vec<String> = [
        "innd",
        "--pathhost",
        "me.example",
        "--active-file",
        &path("db/active"),
        "--history-file",
        &path("db/history"),
        "--newsfeeds-file",
        &path("etc/newsfeeds"),
        "--hosts-file",
        &path("etc/hosts.nntp"),
        "--hosts-nolimit-file",
        &path("etc/hosts.nntp.nolimit"),
        "--overview-dir",
        &path("spool/overview"),
        "--spool-dir",
        &path("spool/articles"),
        "--outgoing-dir",
        &path("spool/outgoing"),
        "--incoming-dir",
        &path("spool/incoming"),
        "--run-dir",
        &path("run"),
        "--control-dir",
        &path("etc/control"),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(extra_args.iter().map(|s| s.to_string()));

    // Dead feed children must not kill the test process.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let cfg = Config::parse_from(args);
    let mut server = Server::new(cfg).unwrap();
    for idx in 0..server.sites.len() {
        assert!(server.site_setup(idx));
    }
    (dir, server)
}

// An NNTP channel whose descriptor is the write end of a pipe; replies
// can be read back from the other end.
fn nntp_channel(server: &mut Server, host: &str) -> (RawFd, OwnedFd) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    prepare_fd(fds[0]).unwrap();
    prepare_fd(fds[1]).unwrap();

    let mut ch = Channel::new(write_end, ChanType::Nntp, ChanState::GetCmd, server.now);
    ch.hostname = host.to_string();
    ch.streaming = true;
    let raw = server.insert_channel(ch, true);
    (raw, read_end)
}

fn push(server: &mut Server, fd: RawFd, bytes: &[u8]) {
    let mut ch = server.chans.take(fd).unwrap();
    ch.in_buf.append(bytes);
    match server.nc_process(&mut ch) {
        Disposition::Keep => server.chans.put(ch),
        Disposition::Close => server.close_channel(ch),
    }
}

fn replies(read_end: &OwnedFd) -> String {
    use std::os::fd::AsRawFd;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match chan_read(read_end.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn article(msgid: &str, newsgroups: &str, extra_headers: &str, body: &str) -> Vec<u8> {
    let mut wire = format!(
        "Path: peer.example!not-for-mail\r\n\
         From: alice@x.example\r\n\
         Newsgroups: {newsgroups}\r\n\
         Subject: testing\r\n\
         Message-ID: {msgid}\r\n\
         Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n"
    );
    wire.push_str(extra_headers);
    wire.push_str("\r\n");
    wire.push_str(body);
    wire.push_str(".\r\n");
    wire.into_bytes()
}

#[test]
fn accept_and_propagate() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <a@b>\r\n");
    assert!(replies(&rd).starts_with("335"), "expected 335");

    push(&mut server, fd, &article("<a@b>", "misc.test", "", "hi\r\n"));
    assert!(replies(&rd).starts_with("235"), "expected 235");

    // History knows the article.
    assert!(server.history.have(MsgidHash::of("<a@b>")));

    // Overview gained entry number 1 for misc.test.
    let stats = server.overview.group_stats("misc.test").unwrap().unwrap();
    assert_eq!(stats, (1, 1, 1));

    // The active high-water mark advanced.
    let gi = server.active.find("misc.test").unwrap();
    assert_eq!(server.active.group(gi).last, 1);

    // The file site holds one record naming the token and the ID.
    let site_fd = server.sites[0].chan_fd.unwrap();
    let pending = server.chans.get(site_fd).unwrap().out_buf.pending().to_vec();
    let record = String::from_utf8(pending).unwrap();
    assert!(record.contains("<a@b>"), "{record}");
    assert!(record.contains('@'), "{record}");
}

#[test]
fn duplicate_refused() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <dup@x>\r\n");
    push(&mut server, fd, &article("<dup@x>", "misc.test", "", "b\r\n"));
    let _ = replies(&rd);
    let before = server.overview.group_stats("misc.test").unwrap();

    push(&mut server, fd, b"IHAVE <dup@x>\r\n");
    let reply = replies(&rd);
    assert!(reply.starts_with("435"), "{reply}");
    assert_eq!(server.overview.group_stats("misc.test").unwrap(), before);
    assert_eq!(server.chans.get(fd).unwrap().refused, 1);
}

#[test]
fn wip_race_between_peers() {
    let (_dir, mut server) = test_server(&[]);
    let (fd1, rd1) = nntp_channel(&mut server, "one.example");
    let (fd2, rd2) = nntp_channel(&mut server, "two.example");

    push(&mut server, fd1, b"CHECK <c@d>\r\n");
    assert!(replies(&rd1).starts_with("238"));

    push(&mut server, fd2, b"CHECK <c@d>\r\n");
    assert!(replies(&rd2).starts_with("431"));

    let mut takethis = b"TAKETHIS <c@d>\r\n".to_vec();
    takethis.extend_from_slice(&article("<c@d>", "misc.test", "", "x\r\n"));
    push(&mut server, fd1, &takethis);
    assert!(replies(&rd1).starts_with("239"));

    let mut takethis = b"TAKETHIS <c@d>\r\n".to_vec();
    takethis.extend_from_slice(&article("<c@d>", "misc.test", "", "x\r\n"));
    push(&mut server, fd2, &takethis);
    assert!(replies(&rd2).starts_with("439"));
}

#[test]
fn cancel_with_matching_poster() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <e@f>\r\n");
    push(&mut server, fd, &article("<e@f>", "misc.test", "", "original\r\n"));
    let accept = replies(&rd);
    assert!(accept.contains("235"), "{accept}");

    let token = server
        .history
        .token_for(MsgidHash::of("<e@f>"))
        .unwrap()
        .unwrap();
    server.spool.retrieve(token, storage::Retrieve::Stat).unwrap();

    push(&mut server, fd, b"IHAVE <cancel-1@x>\r\n");
    push(
        &mut server,
        fd,
        &article(
            "<cancel-1@x>",
            "misc.test",
            "Control: cancel <e@f>\r\n",
            "cancel\r\n",
        ),
    );
    let reply = replies(&rd);
    assert!(reply.contains("235"), "{reply}");

    // The stored article is gone, and later offers are refused.
    assert!(matches!(
        server.spool.retrieve(token, storage::Retrieve::Stat),
        Err(storage::Error::NotFound)
    ));
    push(&mut server, fd, b"IHAVE <e@f>\r\n");
    assert!(replies(&rd).starts_with("435"));
}

#[test]
fn cancel_with_wrong_poster_keeps_article() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <keep@f>\r\n");
    push(&mut server, fd, &article("<keep@f>", "misc.test", "", "original\r\n"));
    let _ = replies(&rd);
    let token = server
        .history
        .token_for(MsgidHash::of("<keep@f>"))
        .unwrap()
        .unwrap();

    // A different poster tries to cancel it.
    push(&mut server, fd, b"IHAVE <cancel-2@x>\r\n");
    let mut wire = format!(
        "Path: peer.example!not-for-mail\r\n\
         From: mallory@evil.example\r\n\
         Newsgroups: misc.test\r\n\
         Subject: bogus cancel\r\n\
         Message-ID: <cancel-2@x>\r\n\
         Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
         Control: cancel <keep@f>\r\n\r\nc\r\n"
    );
    wire.push_str(".\r\n");
    push(&mut server, fd, wire.as_bytes());
    let _ = replies(&rd);

    server.spool.retrieve(token, storage::Retrieve::Stat).unwrap();
}

#[test]
fn xref_slave_adopts_peer_numbering() {
    let (_dir, mut server) = test_server(&["--xrefslave"]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <slave@x>\r\n");
    push(
        &mut server,
        fd,
        &article(
            "<slave@x>",
            "news.admin.peering,comp.lang.c",
            "Xref: peer.example news.admin.peering:42 comp.lang.c:1001\r\n",
            "s\r\n",
        ),
    );
    let reply = replies(&rd);
    assert!(reply.contains("235"), "{reply}");

    let gi = server.active.find("news.admin.peering").unwrap();
    assert_eq!(server.active.group(gi).last, 42);
    let gi = server.active.find("comp.lang.c").unwrap();
    assert_eq!(server.active.group(gi).last, 1001);

    // The stored Xref is the peer's, byte for byte.
    let token = server
        .history
        .token_for(MsgidHash::of("<slave@x>"))
        .unwrap()
        .unwrap();
    let stored = server.spool.retrieve(token, storage::Retrieve::All).unwrap();
    let xref = crate::art::find_header(&stored, "Xref").unwrap();
    assert_eq!(xref, "peer.example news.admin.peering:42 comp.lang.c:1001");
}

#[test]
fn unwanted_group_rejected_and_remembered() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <nowhere@x>\r\n");
    push(&mut server, fd, &article("<nowhere@x>", "alt.does.not.exist", "", "b\r\n"));
    let reply = replies(&rd);
    assert!(reply.contains("437"), "{reply}");

    // remember-trash defaults on: the ID is now refused outright.
    push(&mut server, fd, b"IHAVE <nowhere@x>\r\n");
    assert!(replies(&rd).starts_with("435"));
}

#[test]
fn moderated_group_requires_approval() {
    let (_dir, mut server) = test_server(&[]);
    server.active.changegroup("misc.test", active::GroupFlag::Moderated).unwrap();
    server.rebuild_subscriptions();
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <unapproved@x>\r\n");
    push(&mut server, fd, &article("<unapproved@x>", "misc.test", "", "b\r\n"));
    let reply = replies(&rd);
    assert!(reply.contains("437 Unapproved"), "{reply}");

    push(&mut server, fd, b"IHAVE <approved@x>\r\n");
    push(
        &mut server,
        fd,
        &article("<approved@x>", "misc.test", "Approved: mod@example\r\n", "b\r\n"),
    );
    let reply = replies(&rd);
    assert!(reply.contains("235"), "{reply}");
}

#[test]
fn oversized_article_is_eaten_and_remembered() {
    let (_dir, mut server) = test_server(&["--max-art-size", "300"]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    push(&mut server, fd, b"IHAVE <big@x>\r\n");
    assert!(replies(&rd).starts_with("335"));

    let big = article("<big@x>", "misc.test", "", &"padding line\r\n".repeat(100));
    push(&mut server, fd, &big);
    let reply = replies(&rd);
    assert!(reply.contains("437"), "{reply}");
    assert!(server.history.have(MsgidHash::of("<big@x>")));
    assert_eq!(server.chans.get(fd).unwrap().state, ChanState::GetCmd);
}

#[test]
fn paused_server_defers_throttled_drops() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    server.mode = Mode::Paused("maintenance".to_string());
    push(&mut server, fd, b"IHAVE <paused@x>\r\n");
    assert!(replies(&rd).starts_with("335"));
    push(&mut server, fd, &article("<paused@x>", "misc.test", "", "b\r\n"));
    // No reply yet: the article is parked until the pause lifts.
    assert_eq!(replies(&rd), "");
    assert_eq!(server.chans.get(fd).unwrap().state, ChanState::Paused);

    server.mode = Mode::Running;
    let mut ch = server.chans.take(fd).unwrap();
    ch.state = ChanState::GetArticle;
    let disp = server.nc_process(&mut ch);
    assert_eq!(disp, Disposition::Keep);
    server.chans.put(ch);
    assert!(replies(&rd).starts_with("235"));
}

#[test]
fn spooled_bytes_survive_channel_death() {
    let (dir, mut server) = test_server(&[]);
    // Replace the file site with a channel feed by hand.
    let text = "ME:*::\n\npipe:*:Tc,Wnm:cat > /dev/null\n";
    std::fs::write(dir.path().join("etc/newsfeeds"), text).unwrap();
    let reply = server.cc_execute("reload newsfeeds");
    assert_eq!(reply, "0 ok");
    assert_eq!(server.sites.len(), 1);

    // The feed's channel dies with a record still buffered.
    let record = b"@01000000990000000000@ <spooled@x>\n";
    let site_fd = server.sites[0].chan_fd.unwrap();
    let mut ch = server.chans.take(site_fd).unwrap();
    ch.out_buf.append(record);
    server.sites[0].chan_fd = Some(site_fd);
    server.site_chan_close(ch);

    // Pending bytes moved to the spool channel, nothing lost.
    assert!(server.sites[0].spooling);
    let spool_fd = server.sites[0].chan_fd.unwrap();
    assert_eq!(server.chans.get(spool_fd).unwrap().out_buf.len(), record.len());

    // The spool wake drains the record to the spool file and brings the
    // real sink back.
    server.site_spool_wake(0, spool_fd);
    assert!(!server.sites[0].spooling);
    let spooled = std::fs::read(dir.path().join("spool/outgoing/pipe")).unwrap();
    assert_eq!(spooled, record);
}

#[test]
fn control_channel_commands() {
    let (_dir, mut server) = test_server(&[]);

    assert_eq!(server.cc_execute("pause why not"), "0 ok");
    assert!(matches!(server.mode, Mode::Paused(_)));
    assert!(server.cc_execute("mode").contains("paused"));
    assert_eq!(server.cc_execute("go"), "0 ok");
    assert_eq!(server.mode, Mode::Running);

    assert_eq!(server.cc_execute("newgroup alt.new y"), "0 ok");
    assert!(server.active.find("alt.new").is_some());
    assert_eq!(server.cc_execute("rmgroup alt.new"), "0 ok");
    assert!(server.active.find("alt.new").is_none());

    let reply = server.cc_execute(
        "addhist <added@x> 1000 - 900 @01000000420000000000@",
    );
    assert_eq!(reply, "0 ok");
    assert!(server.history.have(MsgidHash::of("<added@x>")));

    assert!(server.cc_execute("bogus").starts_with("1 "));
    assert!(server.cc_execute("flush nowhere").starts_with("1 "));
    assert_eq!(server.cc_execute("checkfile"), "0 ok");
}

#[test]
fn aliased_crosspost_files_once() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    // old.name is `=misc.test`; the crosspost must not double-file.
    push(&mut server, fd, b"IHAVE <aliased@x>\r\n");
    push(
        &mut server,
        fd,
        &article("<aliased@x>", "misc.test,old.name", "", "b\r\n"),
    );
    let reply = replies(&rd);
    assert!(reply.contains("235"), "{reply}");

    let gi = server.active.find("misc.test").unwrap();
    assert_eq!(server.active.group(gi).last, 1);
    assert_eq!(server.active.group(gi).post_count, 0);
    let stats = server.overview.group_stats("misc.test").unwrap().unwrap();
    assert_eq!(stats, (1, 1, 1));

    // The stored Xref names the target group exactly once.
    let token = server
        .history
        .token_for(MsgidHash::of("<aliased@x>"))
        .unwrap()
        .unwrap();
    let stored = server.spool.retrieve(token, storage::Retrieve::All).unwrap();
    let xref = crate::art::find_header(&stored, "Xref").unwrap();
    assert_eq!(xref, "me.example misc.test:1");
}

#[test]
fn bad_command_run_resets_on_good_command() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");

    for _ in 0..9 {
        push(&mut server, fd, b"bogus\r\n");
    }
    assert_eq!(server.chans.get(fd).unwrap().bad_commands, 9);

    // A recognised command ends the run; the channel stays healthy.
    push(&mut server, fd, b"HELP\r\n");
    assert_eq!(server.chans.get(fd).unwrap().bad_commands, 0);

    for _ in 0..5 {
        push(&mut server, fd, b"bogus\r\n");
    }
    let ch = server.chans.get(fd).unwrap();
    assert_eq!(ch.bad_commands, 5);
    assert_eq!(ch.state, ChanState::GetCmd);
    let all = replies(&rd);
    assert!(all.contains("100"), "{all}");
}

#[test]
fn streaming_refused_when_not_permitted() {
    let (_dir, mut server) = test_server(&[]);
    let (fd, rd) = nntp_channel(&mut server, "peer.example");
    server.chans.get_mut(fd).unwrap().streaming = false;

    push(&mut server, fd, b"CHECK <nostream@x>\r\n");
    let reply = replies(&rd);
    assert!(reply.starts_with("500"), "{reply}");
}
