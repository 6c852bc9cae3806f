use std::path::PathBuf;

use anyhow::Context;

use pulsebox::config::Config;
use pulsebox::server::Server;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| "/etc/pulsebox.yml".into());
    let conf = Config::load(&path)
        .with_context(|| format!("cannot load config {}", path.display()))?;

    let mut server = Server::new(conf)?;
    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("stopping server");
        stop.stop();
    })
    .context("cannot install the SIGINT handler")?;

    server.run()
}
