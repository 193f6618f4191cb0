use std::path::PathBuf;
use std::time::Duration;

use criproxy::RuntimeProxy;
use structopt::StructOpt;
use tokio::signal::ctrl_c;
use tracing::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "criproxy",
    about = "A CRI proxy that multiplexes several container runtimes behind one kubelet-facing socket"
)]
struct Opts {
    #[structopt(
        long = "listen",
        default_value = "/run/criproxy.sock",
        env = "CRIPROXY_LISTEN",
        help = "The unix socket path the proxy serves the CRI on"
    )]
    listen: PathBuf,

    #[structopt(
        long = "connect",
        default_value = "/var/run/dockershim.sock",
        env = "CRIPROXY_CONNECT",
        help = "Comma-separated list of [id:]path backend CRI sockets; the first entry is the primary runtime and must have no id"
    )]
    connect: String,

    #[structopt(
        long = "connect-timeout",
        default_value = "30",
        env = "CRIPROXY_CONNECT_TIMEOUT",
        help = "Timeout in seconds for the liveness probe run while connecting to a backend"
    )]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addrs: Vec<String> = opts
        .connect
        .split(',')
        .map(|spec| spec.trim().to_string())
        .filter(|spec| !spec.is_empty())
        .collect();
    let proxy = RuntimeProxy::new(&addrs, Duration::from_secs(opts.connect_timeout), None)?;

    let mut server = {
        let proxy = proxy.clone();
        let listen = opts.listen.clone();
        tokio::spawn(async move { proxy.serve(listen, None).await })
    };

    tokio::select! {
        res = &mut server => res??,
        _ = ctrl_c() => {
            info!("signal received, shutting down");
            proxy.stop();
            server.await??;
        }
    }
    Ok(())
}
