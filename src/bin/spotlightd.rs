//! `spotlightd` – Spotlight platform daemon.

use anyhow::{Context, Result, bail};
use spotlight::platform::{Platform, PlatformConfig};
use spotlight::service::Service;
use std::env;
use std::io::{self, BufReader, BufWriter};
use std::net::TcpListener;
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let mut listen_addr: Option<String> = None;
    let mut config = PlatformConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stdio" => {
                // Stdio is the default transport; accept the flag for compatibility.
            }
            "--listen" => {
                let addr = match args.next() {
                    Some(addr) => addr,
                    None => {
                        print_usage();
                        bail!("--listen requires an address argument");
                    }
                };
                listen_addr = Some(addr);
            }
            "--sweep-interval-ms" => {
                let value = match args.next().and_then(|raw| raw.parse().ok()) {
                    Some(value) => value,
                    None => {
                        print_usage();
                        bail!("--sweep-interval-ms requires a millisecond value");
                    }
                };
                config.expiry_interval_ms = value;
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                print_usage();
                bail!("unknown argument: {other}");
            }
        }
    }

    let platform = Platform::start(config).context("failed to start platform")?;
    let platform = Arc::new(platform);

    if let Some(addr) = listen_addr {
        run_tcp(platform, &addr).context("TCP service failed")?;
    } else {
        run_stdio(platform).context("stdio service failed")?;
    }
    Ok(())
}

fn run_stdio(platform: Arc<Platform>) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let reader = stdin.lock();
    let writer = BufWriter::new(stdout.lock());

    let mut service = Service::new(platform);
    service.handle(reader, writer)
}

fn run_tcp(platform: Arc<Platform>, addr: &str) -> io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    let actual = listener.local_addr()?;
    eprintln!("spotlightd listening on {}", actual);

    let mut service = Service::new(platform);
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                let reader = BufReader::new(stream.try_clone()?);
                let writer = BufWriter::new(stream);
                if let Err(err) = service.handle(reader, writer) {
                    eprintln!("connection error from {:?}: {}", peer, err);
                }
            }
            Err(err) => {
                eprintln!("failed to accept connection: {err}");
            }
        }
    }

    Ok(())
}

fn print_usage() {
    eprintln!(
        "Usage: spotlightd [--stdio] [--listen ADDR] [--sweep-interval-ms N]\n\
         \n\
         Options:\n\
           --stdio                Communicate over stdin/stdout (default)\n\
           --listen ADDR          Listen on TCP ADDR instead of stdio\n\
           --sweep-interval-ms N  Expiry sweep period in milliseconds (default: 1000)\n"
    );
}
