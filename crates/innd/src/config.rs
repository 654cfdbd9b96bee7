//! Server configuration, taken from flags and environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// A Usenet news transit server: accepts articles from peers over NNTP,
/// files them into history and overview, and feeds them to configured
/// sites.
#[derive(Debug, Clone, Parser)]
#[command(name = "innd", version, about)]
pub struct Config {
    /// Host name written into Path and Xref headers.
    #[arg(long, env = "INND_PATHHOST")]
    pub pathhost: String,

    /// Extra Path entry inserted after the pathhost when absent.
    #[arg(long, env = "INND_PATHALIAS")]
    pub pathalias: Option<String>,

    /// Address to listen on for peer connections.
    #[arg(long, default_value = "0.0.0.0:119")]
    pub listen: std::net::SocketAddr,

    /// The active file.
    #[arg(long, default_value = "db/active")]
    pub active_file: PathBuf,

    /// Newsgroup descriptions, served by LIST NEWSGROUPS.
    #[arg(long, default_value = "db/newsgroups")]
    pub newsgroups_file: PathBuf,

    /// The history text file.
    #[arg(long, default_value = "db/history")]
    pub history_file: PathBuf,

    /// The newsfeeds configuration.
    #[arg(long, default_value = "etc/newsfeeds")]
    pub newsfeeds_file: PathBuf,

    /// Incoming peer table.
    #[arg(long, default_value = "etc/hosts.nntp")]
    pub hosts_file: PathBuf,

    /// Peers exempt from connection limits.
    #[arg(long, default_value = "etc/hosts.nntp.nolimit")]
    pub hosts_nolimit_file: PathBuf,

    /// Overview schema file; a stock schema is used when absent.
    #[arg(long)]
    pub overview_schema: Option<PathBuf>,

    /// Root of the per-group overview tree.
    #[arg(long, default_value = "spool/overview")]
    pub overview_dir: PathBuf,

    /// Article store directory.
    #[arg(long, default_value = "spool/articles")]
    pub spool_dir: PathBuf,

    /// Per-site spool files land here.
    #[arg(long, default_value = "spool/outgoing")]
    pub outgoing_dir: PathBuf,

    /// XBATCH payloads land here.
    #[arg(long, default_value = "spool/incoming")]
    pub incoming_dir: PathBuf,

    /// PID file and local sockets.
    #[arg(long, default_value = "run")]
    pub run_dir: PathBuf,

    /// Control-message handler programs, one per control word.
    #[arg(long, default_value = "etc/control")]
    pub control_dir: PathBuf,

    /// Adopt article numbers from the upstream Xref instead of assigning
    /// our own.
    #[arg(long)]
    pub xrefslave: bool,

    /// File articles whose groups are all unknown into junk.
    #[arg(long)]
    pub want_trash: bool,

    /// Write remembered-trash history entries for rejected articles.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub remember_trash: bool,

    /// Require the canceller to match the original poster.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub verify_cancels: bool,

    /// Refuse `<cancel.…>` message-IDs outright.
    #[arg(long)]
    pub refuse_cybercancels: bool,

    /// Answer WIP collisions with a refusal instead of a deferral, for
    /// peers that never resend.
    #[arg(long)]
    pub no_resend_id: bool,

    /// Largest acceptable article, bytes.
    #[arg(long, default_value_t = 1_000_000)]
    pub max_art_size: usize,

    /// Reject articles whose Date is older than this; zero disables.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub art_cutoff: Duration,

    /// Tolerated difference between the Lines header and reality; zero
    /// disables the check.
    #[arg(long, default_value_t = 0)]
    pub linecount_fuzz: i64,

    /// Simultaneous incoming NNTP connections.
    #[arg(long, default_value_t = 50)]
    pub max_connections: usize,

    /// Incoming connections allowed per host.
    #[arg(long, default_value_t = 2)]
    pub remote_limit: usize,

    /// Window over which per-host connections are remembered; zero
    /// disables the limiter.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub remote_timer: Duration,

    /// Total remembered connections in the limiter window.
    #[arg(long, default_value_t = 60)]
    pub remote_total: usize,

    /// File-feed descriptors kept open before LRU buffering kicks in.
    #[arg(long, default_value_t = 10)]
    pub max_outgoing: usize,

    /// How long an offered message-ID stays claimed by one peer.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub wip_hold: Duration,

    /// Main-loop housekeeping interval (history sync, active flush).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "300s")]
    pub timeout: Duration,

    /// Close an NNTP channel idle longer than this.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    pub peer_timeout: Duration,

    /// Log a silence note on an idle channel at this interval.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    pub inactive_time: Duration,

    /// Tear down reject channels after this long.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub reject_timeout: Duration,

    /// Retry a spooling site's real sink after this long.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub chan_retry_time: Duration,

    /// Retry window after repeated bad writes, and the pause retry time.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
    pub pause_retry_time: Duration,

    /// Per-blocked-write backoff step.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    pub block_backoff: Duration,

    /// Consecutive bad reads/writes tolerated before drastic action.
    #[arg(long, default_value_t = 5)]
    pub bad_io_count: u32,

    /// Consecutive bad commands tolerated before closing a channel.
    #[arg(long, default_value_t = 10)]
    pub bad_command_count: u32,

    /// History writes between forced syncs.
    #[arg(long, default_value_t = 10)]
    pub history_sync_count: u32,

    /// Per-channel dispositions between checkpoint log lines.
    #[arg(long, default_value_t = 200)]
    pub checkpoint_count: u64,

    /// Trace channel I/O.
    #[arg(long)]
    pub tracing: bool,
}

impl Config {
    pub fn pid_file(&self) -> PathBuf {
        self.run_dir.join("innd.pid")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.run_dir.join("innd.ctl")
    }

    pub fn local_socket(&self) -> PathBuf {
        self.run_dir.join("nntpin")
    }

    /// The Path prefix this server contributes: `pathhost!`.
    pub fn path_prefix(&self) -> String {
        format!("{}!", self.pathhost)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cfg = Config::parse_from(["innd", "--pathhost", "news.example.com"]);
        assert_eq!(cfg.pathhost, "news.example.com");
        assert_eq!(cfg.max_art_size, 1_000_000);
        assert!(cfg.remember_trash);
        assert_eq!(cfg.wip_hold, Duration::from_secs(5));
        assert_eq!(cfg.path_prefix(), "news.example.com!");
    }

    #[test]
    fn toggles_accept_values() {
        let cfg = Config::parse_from([
            "innd",
            "--pathhost",
            "h",
            "--remember-trash",
            "false",
            "--xrefslave",
        ]);
        assert!(!cfg.remember_trash);
        assert!(cfg.xrefslave);
    }
}
