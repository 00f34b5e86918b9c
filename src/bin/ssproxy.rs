//! Client-side forwarding proxy binary
//!
//! Listens on the configured local port and forwards everything to one
//! fixed remote destination through the configured relay servers, picking
//! a healthy server per connection.

use std::process;
use std::sync::Arc;

use clap::{Arg, Command};
use log::{error, info, LevelFilter};

use sstunnel::config::Config;
use sstunnel::local;
use sstunnel::relay::address::Address;
use tokio::net::{TcpListener, UdpSocket};

fn main() {
    let matches = Command::new("ssproxy")
        .version(sstunnel::VERSION)
        .about("Encrypted tunnel forwarding proxy")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .takes_value(true)
                .default_value("config.json")
                .help("configuration file"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("print debug messages"),
        )
        .arg(
            Arg::new("listen")
                .short('L')
                .long("listen")
                .takes_value(true)
                .default_value("127.0.0.1")
                .help("local listen address"),
        )
        .arg(
            Arg::new("remote-host")
                .short('A')
                .long("remote-host")
                .takes_value(true)
                .help("remote destination host"),
        )
        .arg(
            Arg::new("remote-port")
                .short('P')
                .long("remote-port")
                .takes_value(true)
                .help("remote destination port"),
        )
        .arg(
            Arg::new("mode")
                .short('M')
                .long("mode")
                .takes_value(true)
                .default_value("tcp")
                .possible_values(["tcp", "udp", "tcpudp"])
                .help("forwarding mode"),
        )
        .get_matches();

    let level = if matches.is_present("debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let config_path = matches.value_of("config").unwrap_or("config.json");
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error reading {config_path}: {err}");
            process::exit(1);
        }
    };

    let local_port = match config.local_port {
        Some(port) if port != 0 => port,
        _ => {
            eprintln!("must specify local_port");
            process::exit(1);
        }
    };

    let target = {
        let host = matches.value_of("remote-host").unwrap_or_default();
        let port = matches.value_of("remote-port").unwrap_or_default();
        if host.is_empty() || port.is_empty() {
            eprintln!("must specify remote destination with -A and -P");
            process::exit(1);
        }
        match port.parse::<u16>() {
            Ok(port) => Address::DomainNameAddress(host.to_owned(), port),
            Err(..) => {
                eprintln!("invalid remote port {port:?}");
                process::exit(1);
            }
        }
    };

    let dispatcher = match local::build_dispatcher(&config) {
        Ok(d) => Arc::new(d),
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let listen_host = matches.value_of("listen").unwrap_or("127.0.0.1").to_owned();
    let mode = matches.value_of("mode").unwrap_or("tcp").to_owned();
    let user_id = config.user_id.unwrap_or(0);
    let ota = config.auth;
    let udp_timeout = config.udp_timeout();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            process::exit(1);
        }
    };

    let result: std::io::Result<()> = runtime.block_on(async move {
        if mode == "tcp" || mode == "tcpudp" {
            let listener = TcpListener::bind((listen_host.as_str(), local_port)).await?;
            let dispatcher = dispatcher.clone();
            let target = target.clone();
            tokio::spawn(async move {
                if let Err(err) = local::run_tcp_forward(dispatcher, listener, target, user_id, ota).await {
                    error!("tcp forwarder terminated: {err}");
                }
            });
        }

        if mode == "udp" || mode == "tcpudp" {
            let socket = UdpSocket::bind((listen_host.as_str(), local_port)).await?;
            let dispatcher = dispatcher.clone();
            let target = target.clone();
            tokio::spawn(async move {
                if let Err(err) = local::run_udp_forward(dispatcher, socket, target, user_id, ota, udp_timeout).await {
                    error!("udp forwarder terminated: {err}");
                }
            });
        }

        if config.enable_dns_proxy {
            if let Some(ref dns_server) = config.target_dns_server {
                match dns_server.parse() {
                    Ok(dns_addr) => {
                        let dns_target = Address::SocketAddress(dns_addr);
                        let dns_port = config.dns_proxy_port.unwrap_or(53);
                        let socket = UdpSocket::bind((listen_host.as_str(), dns_port)).await?;
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                local::run_udp_forward(dispatcher, socket, dns_target, user_id, ota, udp_timeout).await
                            {
                                error!("dns forwarder terminated: {err}");
                            }
                        });
                    }
                    Err(..) => error!("invalid target_dns_server {dns_server:?}, dns proxy disabled"),
                }
            }
        }

        info!("ready");
        wait_signals().await
    });

    if let Err(err) = result {
        eprintln!("{err}");
        process::exit(1);
    }
}

#[cfg(unix)]
async fn wait_signals() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    // nothing to reload on the client; SIGHUP is deliberately ignored
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_signals() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
