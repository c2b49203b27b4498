//! Fluxgate - transparent tunneling gateway

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fluxgate::config::Config;
use fluxgate::dns::DnsServer;
use fluxgate::error::Result;
use fluxgate::policy::{PolicyList, RoutingTable};
use fluxgate::proxy::ProxyClient;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&Config::default_config()).unwrap()
        );
        return Ok(());
    }

    let config = match args.config {
        Some(path) => Config::load(&path)?,
        None => {
            print_help();
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the config file level
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Fluxgate v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))?;

    info!("Goodbye!");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let policy = Arc::new(PolicyList::new());
    for file in &config.policy.domain_files {
        policy.load_file(file)?;
    }
    for domain in &config.policy.domains {
        policy.add_domain(domain);
    }
    let routing = Arc::new(RoutingTable::new());

    let proxy = ProxyClient::start(&config).await?;
    let dns = DnsServer::start(&config.dns, policy, routing, proxy.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    dns.stop().await;
    proxy.stop().await;
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Fluxgate - transparent tunneling gateway

USAGE:
    fluxgate [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    fluxgate -c /etc/fluxgate/config.json
    fluxgate --gen-config > config.json

The gateway expects the host packet filter to TPROXY-redirect TCP and UDP
traffic to the configured listen port, with the matching routing rules:

    iptables -t mangle -A PREROUTING -p tcp -j TPROXY --on-port 7300 --tproxy-mark 0x1
    iptables -t mangle -A PREROUTING -p udp -j TPROXY --on-port 7300 --tproxy-mark 0x1
    ip rule add fwmark 0x1 lookup 100
    ip route add local 0.0.0.0/0 dev lo table 100
"#
    );
}

fn print_version() {
    println!("Fluxgate v{}", env!("CARGO_PKG_VERSION"));
    println!("Transparent tunneling gateway with split-horizon DNS");
}
