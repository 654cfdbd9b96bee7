//! innd: the article-ingestion and propagation daemon.

mod art;
mod buffer;
mod cc;
mod chan;
mod config;
mod headers;
mod lc;
mod nc;
mod proc;
mod rc;
mod server;
mod site;
#[cfg(test)]
mod tests;
mod wip;

use anyhow::Context;
use clap::Parser;

use crate::config::Config;
use crate::server::Server;

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = Config::parse();
    server::install_signal_handlers();

    let mut server = Server::new(cfg).context("starting server")?;
    for idx in 0..server.sites.len() {
        if !server.site_setup(idx) {
            tracing::error!(site = %server.sites[idx].config.name, "cant set up site");
        }
    }
    server.rc_setup().context("remote listener")?;
    server.lc_setup().context("local listener")?;
    server.cc_setup().context("control channel")?;
    server.write_pid_file()?;

    tracing::info!("starting main loop");
    server.run()
}
