//! funnel binary.

use clap::Parser;
use funnel::Config;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "funnel")]
#[command(about = "Pipelining fan-in proxy for RESP upstreams")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream endpoint override (host:port)
    #[arg(long)]
    upstream: Option<String>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(listen) = args.listen {
        config.proxy.listen = listen;
    }
    if let Some(upstream) = &args.upstream {
        match parse_endpoint(upstream) {
            Some((host, port)) => {
                config.upstream.host = host;
                config.upstream.port = port;
            }
            None => {
                eprintln!("Invalid upstream endpoint: {}", upstream);
                std::process::exit(1);
            }
        }
    }

    funnel::logging::init(&config.logging);

    if let Err(e) = funnel::run(config) {
        tracing::error!(error = %e, "fatal proxy error");
        std::process::exit(1);
    }
}

/// Split a `host:port` endpoint string.
fn parse_endpoint(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

fn print_default_config() {
    let config = r#"# funnel configuration

[proxy]
# Address to listen on for client connections
listen = "0.0.0.0:6380"

[upstream]
# Upstream endpoint
host = "127.0.0.1"
port = 6379

# Policy for replies with no awaiting client (e.g. server push frames):
# "exit" stops the process, "disconnect" drops and re-opens the upstream
excess_replies = "exit"

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"
"#;
    print!("{}", config);
}
