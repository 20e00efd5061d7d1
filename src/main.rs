use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use signal_hook::consts::signal;
use signal_hook::iterator::exfiltrator::SignalOnly;
use signal_hook::iterator::SignalsInfo;
use tokio::net::{TcpListener, TcpSocket};

use cacheproxy::events::EventLog;
use cacheproxy::worker::Proxy;
use cacheproxy::Config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct CacheProxy {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy server
    Start {
        /// Path to the config file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cacheproxy = CacheProxy::parse();
    match cacheproxy.command {
        Some(Command::Start { config }) => start(config).await?,
        _ => (),
    }
    Ok(())
}

async fn start(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    cacheproxy::init_logging();
    let config = match config {
        Some(path) => cacheproxy::load_config(&path)?,
        None => Config::default(),
    };
    log::info!(listen = config.listen.clone(), cache_capacity = config.cache_capacity; "start_proxy");
    let events = EventLog::open(&config.event_log)?;
    let proxy = Arc::new(Proxy::new(config.cache_capacity, events));
    // Listener-setup failures are the only fatal errors; everything after
    // this point is confined to individual connections.
    let listener = bind(&config)?;
    run_background(proxy, listener);
    let mut signals = SignalsInfo::<SignalOnly>::new([signal::SIGTERM, signal::SIGINT])?;
    for signal in &mut signals {
        match signal {
            signal::SIGTERM | signal::SIGINT => break,
            _ => (),
        }
    }
    log::info!("exit_proxy");
    Ok(())
}

fn bind(config: &Config) -> Result<TcpListener, Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.listen.parse()?;
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(config.backlog)?)
}

fn run_background(proxy: Arc<Proxy>, listener: TcpListener) {
    tokio::spawn(async move {
        let mut client_id: u32 = 0;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let proxy = Arc::clone(&proxy);
                    let id = client_id;
                    client_id = if client_id == i32::MAX as u32 {
                        0
                    } else {
                        client_id + 1
                    };
                    tokio::spawn(async move {
                        proxy.handle(id, stream, peer.ip()).await;
                    });
                }
                Err(e) => {
                    log::error!(error = e.to_string(); "tcp_accept_error");
                }
            }
        }
    });
}
