#![warn(missing_docs)]

//! rdmaperf driver: a bandwidth test run as an in-process loopback, or as
//! separate server and client processes over RDMA hardware.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use rdmaperf_rdma::{
    ConnectionControl, PendingConnections, RdmaConfig, RdmaProvider, SimFabric, TransferMode,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Verbs implementation to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// In-process simulated fabric (loopback only).
    Sim,
    /// librdmacm/libibverbs; needs the `hardware` build feature.
    Hw,
}

/// Which side(s) of the test this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RoleArg {
    /// Listener and client in one process.
    Loopback,
    /// Accept one client and serve its rounds.
    Server,
    /// Connect to a server and drive the rounds.
    Client,
}

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "rdmaperf", about = "RDMA bandwidth test")]
struct Args {
    /// Config file (.toml or .json); flags override it.
    #[arg(short, long, env = "RDMAPERF_CONFIG")]
    config: Option<PathBuf>,

    /// Verbs provider.
    #[arg(long, value_enum, default_value_t = ProviderKind::Sim)]
    provider: ProviderKind,

    /// Process role.
    #[arg(long, value_enum, default_value_t = RoleArg::Loopback)]
    role: RoleArg,

    /// Server address the client connects to (client role).
    #[arg(long, value_name = "ADDR")]
    server: Option<SocketAddr>,

    /// Address the server listens on; the port comes from --port.
    #[arg(long, default_value = "0.0.0.0")]
    bind: std::net::IpAddr,

    /// Bytes moved per round.
    #[arg(short, long)]
    size: Option<usize>,

    /// Client transfer mode (passive-read, passive-write, active-read, active-write).
    #[arg(short, long)]
    mode: Option<TransferMode>,

    /// Number of rounds.
    #[arg(short, long, default_value_t = 10)]
    rounds: u32,

    /// Port the server listens on.
    #[arg(short, long, default_value_t = 7471)]
    port: u16,

    /// Seconds the server waits for a client.
    #[arg(long, default_value_t = 60)]
    accept_timeout: u64,

    /// Print data the server reads.
    #[arg(short, long)]
    verbose: bool,

    /// Append data the server reads to this file.
    #[arg(short, long)]
    output_file: Option<PathBuf>,
}

impl Args {
    fn client_config(&self) -> Result<RdmaConfig> {
        let mut config = match &self.config {
            Some(path) => RdmaConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RdmaConfig::default(),
        };
        if let Some(size) = self.size {
            config.size = size;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        config.validate()?;
        Ok(config)
    }

    /// Server side of `client`: the mode is replaced by the one each
    /// client descriptor carries, so this is only the starting value.
    fn server_config(&self, client: &RdmaConfig) -> RdmaConfig {
        RdmaConfig {
            mode: client.mode.wire().local_mode(),
            verbose: self.verbose || client.verbose,
            output_file: self.output_file.clone().or_else(|| client.output_file.clone()),
            ..client.clone()
        }
    }

    fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[cfg(feature = "hardware")]
fn hardware_provider() -> Result<Arc<dyn RdmaProvider>> {
    Ok(Arc::new(rdmaperf_rdma::HwProvider::new()))
}

#[cfg(not(feature = "hardware"))]
fn hardware_provider() -> Result<Arc<dyn RdmaProvider>> {
    bail!("this rdmaperf was built without the `hardware` feature")
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let client_cfg = args.client_config()?;
    let server_cfg = args.server_config(&client_cfg);
    info!(
        provider = ?args.provider,
        role = ?args.role,
        size = client_cfg.size,
        client_mode = %client_cfg.mode,
        rounds = args.rounds,
        "rdmaperf starting"
    );

    match (args.provider, args.role) {
        (ProviderKind::Sim, RoleArg::Loopback) => {
            let fabric = SimFabric::new();
            let provider: Arc<dyn RdmaProvider> = Arc::new(fabric.clone());
            loopback(&args, client_cfg, server_cfg, provider)?;
            info!(stats = ?fabric.stats(), "fabric stats");
            Ok(())
        }
        (ProviderKind::Sim, role) => {
            bail!("the simulated fabric lives in one process; use --role loopback or --provider hw (got {role:?})")
        }
        (ProviderKind::Hw, RoleArg::Loopback) => {
            loopback(&args, client_cfg, server_cfg, hardware_provider()?)
        }
        (ProviderKind::Hw, RoleArg::Server) => serve(&args, server_cfg, hardware_provider()?),
        (ProviderKind::Hw, RoleArg::Client) => {
            let dst = args
                .server
                .ok_or_else(|| anyhow!("--server is required for the client role"))?;
            drive(&args, client_cfg, hardware_provider()?, dst)
        }
    }
}

fn listener(
    args: &Args,
    cfg: &RdmaConfig,
    provider: &Arc<dyn RdmaProvider>,
    pending: &PendingConnections,
) -> Result<ConnectionControl> {
    let mut listener = ConnectionControl::server(cfg.clone(), provider.clone(), pending.clone())?;
    listener.setup()?;
    listener.listen(args.listen_addr())?;
    info!(addr = %args.listen_addr(), "listening");
    Ok(listener)
}

fn accept_one(
    pending: &PendingConnections,
    cfg: RdmaConfig,
    provider: Arc<dyn RdmaProvider>,
    timeout: Duration,
) -> Result<ConnectionControl> {
    let conn = pending
        .pop_timeout(timeout)
        .context("no connection request arrived")?;
    let mut server = ConnectionControl::accepted(conn, cfg, provider)?;
    server.setup()?;
    server.setup_qp()?;
    server.setup_buffers()?;
    server.accept()?;
    Ok(server)
}

fn connect(
    cfg: RdmaConfig,
    provider: Arc<dyn RdmaProvider>,
    dst: SocketAddr,
) -> Result<ConnectionControl> {
    let mut client = ConnectionControl::client(cfg, provider)?;
    client.setup()?;
    client.resolve(dst)?;
    client.setup_qp()?;
    client.setup_buffers()?;
    client.connect()?;
    info!(%dst, "connected");
    Ok(client)
}

/// Say why a side failed: the connection manager loop's exit, if it has one.
fn round_failed(conn: &mut ConnectionControl, round: u32, bytes: i64) -> anyhow::Error {
    match conn.cm_loop_exit() {
        Some(Err(e)) => warn!(round, bytes, role = %conn.role(), error = %e, "connection manager loop exited"),
        _ => warn!(round, bytes, role = %conn.role(), state = %conn.state(), "round failed"),
    }
    anyhow!("round {round} failed on the {} side: {bytes}", conn.role())
}

fn report(moved: u64, begin: Instant, conns: &[&ConnectionControl]) -> Result<()> {
    let elapsed = begin.elapsed();
    let mbps = moved as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1e6;
    info!(
        bytes = moved,
        elapsed_ms = elapsed.as_millis() as u64,
        mbps = format_args!("{mbps:.1}"),
        "transfer finished"
    );
    for conn in conns {
        let stats = serde_json::to_string(&conn.ctx().metrics().snapshot())?;
        info!(role = %conn.role(), metrics = %stats, "connection metrics");
    }
    Ok(())
}

fn loopback(
    args: &Args,
    client_cfg: RdmaConfig,
    server_cfg: RdmaConfig,
    provider: Arc<dyn RdmaProvider>,
) -> Result<()> {
    let pending = PendingConnections::new();
    let mut listener = listener(args, &server_cfg, &provider, &pending)?;

    let acceptor = {
        let pending = pending.clone();
        let provider = provider.clone();
        let timeout = Duration::from_secs(args.accept_timeout);
        thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || accept_one(&pending, server_cfg, provider, timeout))?
    };

    let mut dst = args.listen_addr();
    if dst.ip().is_unspecified() {
        dst.set_ip([127, 0, 0, 1].into());
    }
    let mut client = connect(client_cfg, provider, dst)?;
    let mut server = match acceptor.join() {
        Ok(res) => res?,
        Err(_) => bail!("acceptor thread panicked"),
    };

    if let Some(start) = client.buffers().and_then(|b| b.start.as_ref()) {
        start.write_bytes(0, b"rdmaperf ping")?;
    }

    let begin = Instant::now();
    let mut moved = 0u64;
    for round in 0..args.rounds {
        let (c, s) = thread::scope(|scope| {
            let s = scope.spawn(|| server.run_transfer());
            let c = client.run_transfer();
            (c, s.join().unwrap_or(-1))
        });
        if s < 0 {
            return Err(round_failed(&mut server, round, s));
        }
        if c < 0 {
            return Err(round_failed(&mut client, round, c));
        }
        moved += c as u64;
    }
    report(moved, begin, &[&client, &server])?;

    drop(client);
    drop(server);
    pending.close();
    listener.shutdown();
    Ok(())
}

fn serve(args: &Args, cfg: RdmaConfig, provider: Arc<dyn RdmaProvider>) -> Result<()> {
    let pending = PendingConnections::new();
    let mut listener = listener(args, &cfg, &provider, &pending)?;
    let mut server = accept_one(
        &pending,
        cfg,
        provider,
        Duration::from_secs(args.accept_timeout),
    )?;

    let begin = Instant::now();
    let mut moved = 0u64;
    for round in 0..args.rounds {
        let n = server.run_transfer();
        if n < 0 {
            return Err(round_failed(&mut server, round, n));
        }
        moved += n as u64;
    }
    report(moved, begin, &[&server])?;

    drop(server);
    pending.close();
    listener.shutdown();
    Ok(())
}

fn drive(
    args: &Args,
    cfg: RdmaConfig,
    provider: Arc<dyn RdmaProvider>,
    dst: SocketAddr,
) -> Result<()> {
    let mut client = connect(cfg, provider, dst)?;
    if let Some(start) = client.buffers().and_then(|b| b.start.as_ref()) {
        start.write_bytes(0, b"rdmaperf ping")?;
    }

    let begin = Instant::now();
    let mut moved = 0u64;
    for round in 0..args.rounds {
        let n = client.run_transfer();
        if n < 0 {
            return Err(round_failed(&mut client, round, n));
        }
        moved += n as u64;
    }
    report(moved, begin, &[&client])?;
    Ok(())
}
