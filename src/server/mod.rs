//! Relay server engine
//!
//! One TCP accept loop and one UDP receive loop per configured listen
//! port, all sharing a `ServiceContext`. SIGHUP reloads credentials and
//! timeouts in place without disturbing established connections; any
//! other termination signal ends the process.

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info};
use tokio::net::{TcpListener, UdpSocket};

use crate::acl::HostBlockList;
use crate::config::{Config, ConfigError};
use crate::context::ServiceContext;
use crate::stats::StatsService;
use crate::users::{LicenseProvider, MemoryCredentials};

pub mod tcprelay;
pub mod udprelay;

pub struct Server {
    config: Config,
    config_path: Option<PathBuf>,
    context: Arc<ServiceContext>,
    credentials: Arc<MemoryCredentials>,
}

impl Server {
    /// Build the engine state. Must be called inside an async runtime:
    /// the statistics worker spawns immediately.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        block_list: Option<HostBlockList>,
        license: Arc<dyn LicenseProvider>,
    ) -> Result<Server, ConfigError> {
        let method = config.method()?;
        let (stats, _worker) = StatsService::spawn();

        let credentials = Arc::new(MemoryCredentials::from_map(config.user_map()));
        let context = ServiceContext::new(
            method,
            config.auth,
            config.timeout(),
            config.udp_timeout(),
            stats,
            credentials.clone(),
            license,
            block_list,
        );

        Ok(Server {
            config,
            config_path,
            context,
            credentials,
        })
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Bind every configured port and serve until a termination signal.
    /// Bind failures are fatal and propagate to the caller.
    pub async fn run(self) -> io::Result<()> {
        let ports = self
            .config
            .port_password()
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;

        for port in ports.keys() {
            let port: u16 = port
                .parse()
                .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("invalid listen port {port:?}")))?;

            let tcp_listener = TcpListener::bind(("::", port)).await?;
            let udp_socket = UdpSocket::bind(("::", port)).await?;
            info!("relay server listening on port {port}");

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(err) = tcprelay::run(context, tcp_listener).await {
                    error!("tcp relay on port {port} terminated: {err}");
                }
            });

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(err) = udprelay::run(context, udp_socket).await {
                    error!("udp relay on port {port} terminated: {err}");
                }
            });
        }

        self.wait_signals().await
    }

    #[cfg(unix)]
    async fn wait_signals(&self) -> io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = hangup.recv() => self.reload(),
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_signals(&self) -> io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        Ok(())
    }

    /// Re-read the configuration file and swap credentials and timeouts.
    /// Listeners and live connections are untouched.
    fn reload(&self) {
        let path = match self.config_path {
            Some(ref path) => path,
            None => {
                info!("no configuration file to reload");
                return;
            }
        };

        match Config::load(path) {
            Ok(config) => {
                self.credentials.replace(config.user_map());
                self.context.set_timeouts(config.timeout(), config.udp_timeout());
                info!("configuration reloaded, {} users", self.credentials.len());
            }
            Err(err) => error!("configuration reload failed: {err}"),
        }
    }
}
