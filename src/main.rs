#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use janus_proxy::config::CliOverrides;
use janus_proxy::server::bootstrap;

#[derive(Parser)]
#[command(
    name = "janus-proxy",
    about = "Minimal HTTP/1.1 reverse proxy with round-robin upstreams, connection limits and circuit breaking"
)]
struct Cli {
    /// Config file path (YAML); a port number or IP address here is taken
    /// as a listen override instead
    #[arg(value_name = "CONFIG")]
    config: Option<String>,

    /// Listen host override
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// Listen port override
    #[arg(value_name = "PORT")]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = CliOverrides::from_positionals(cli.config, cli.host, cli.port);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(overrides))
}
