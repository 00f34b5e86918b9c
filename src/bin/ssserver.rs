//! Relay server binary
//!
//! Reads the JSON configuration, binds every configured port and serves
//! until terminated. SIGHUP reloads credentials and timeouts in place.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Arg, Command};
use log::LevelFilter;

use sstunnel::acl::HostBlockList;
use sstunnel::config::Config;
use sstunnel::users::{LicenseLimit, StaticLicense};
use sstunnel::Server;

fn main() {
    let matches = Command::new("ssserver")
        .version(sstunnel::VERSION)
        .about("Encrypted tunnel relay server")
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
            Arg::new("port")
                .short('p')
                .long("port")
                .takes_value(true)
                .help("override the configured server port"),
        )
        .arg(
            Arg::new("block-list")
                .short('b')
                .long("block-list")
                .takes_value(true)
                .help("file of destination hosts to refuse"),
        )
        .get_matches();

    let level = if matches.is_present("debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let config_path = PathBuf::from(matches.value_of("config").unwrap_or("config.json"));
    let mut config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error reading {}: {err}", config_path.display());
            process::exit(1);
        }
    };

    if let Some(port) = matches.value_of("port") {
        match port.parse::<u16>() {
            Ok(port) => config.server_port = Some(port),
            Err(..) => {
                eprintln!("invalid port {port:?}");
                process::exit(1);
            }
        }
    }

    let block_list = match matches.value_of("block-list") {
        Some(path) => match HostBlockList::load(path) {
            Ok(list) => Some(list),
            Err(err) => {
                // same spirit as config-file fallback: warn and continue
                eprintln!("error reading {path}: {err}, ignoring block list");
                None
            }
        },
        None => None,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        let license = Arc::new(StaticLicense(LicenseLimit::unlimited()));
        let server = Server::new(config, Some(config_path), block_list, license)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        server.run().await
    });

    if let Err(err) = result {
        eprintln!("{err}");
        process::exit(1);
    }
}
