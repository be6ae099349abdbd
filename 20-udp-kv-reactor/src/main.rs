use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use udp_kv_reactor::{
    cli::{Cli, ClientArgs, Command, ServeArgs},
    client::KvClient,
    protocol::Response,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Client(args) => run_client(args),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut server = Server::new(args.into_config())?;
    server.start()?;
    info!(addrs = ?server.local_addrs(), "listening; press ctrl-c to stop");

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    if let Err(err) = signals.block_on(tokio::signal::ctrl_c()) {
        warn!(error = ?err, "failed to listen for ctrl-c");
    }

    server.stop();
    Ok(())
}

fn run_client(args: ClientArgs) -> Result<()> {
    let client = KvClient::connect(args.server)?
        .with_timeout(args.timeout())
        .with_retries(args.retries);
    let response = client
        .send(&args.op.to_request())
        .with_context(|| format!("request to {} failed", args.server))?;
    println!("{}", render_response(&response));
    Ok(())
}

fn render_response(response: &Response) -> String {
    let mut parts = vec![match response.code() {
        Some(code) => format!("{code:?}"),
        None => format!("error_code={:?}", response.error_code),
    }];
    if let Some(value) = &response.value {
        parts.push(format!("value={}", String::from_utf8_lossy(value)));
    }
    if let Some(version) = response.version {
        parts.push(format!("version={version}"));
    }
    if let Some(pid) = response.pid {
        parts.push(format!("pid={pid}"));
    }
    if let Some(count) = response.membership_count {
        parts.push(format!("membership_count={count}"));
    }
    if let Some(wait) = response.overload_wait_time_ms {
        parts.push(format!("overload_wait_time_ms={wait}"));
    }
    parts.join(" ")
}
