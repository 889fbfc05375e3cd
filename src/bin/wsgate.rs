//! Gateway entry point. Positional arguments: bind address, port, service config path,
//! certificate chain PEM path, private key PEM path.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use log::error;

use wsgate::config::ServiceRegistry;
use wsgate::gateway::reactor::Executor;
use wsgate::idle::IdleStrategy;
use wsgate::stream::tls::TlsClientContext;
use wsgate::stream::tls_server::TlsServerContext;

struct Args {
    bind_addr: SocketAddr,
    config_path: String,
    cert_chain_path: String,
    private_key_path: String,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let bind_addr_text = args.next().ok_or("missing bind address")?;
    let port_text = args.next().ok_or("missing port")?;
    let config_path = args.next().ok_or("missing service config path")?;
    let cert_chain_path = args.next().ok_or("missing certificate chain path")?;
    let private_key_path = args.next().ok_or("missing private key path")?;

    let ip: IpAddr = bind_addr_text.parse().map_err(|err| format!("invalid bind address `{bind_addr_text}`: {err}"))?;
    let port: u16 = port_text.parse().map_err(|err| format!("invalid port `{port_text}`: {err}"))?;

    Ok(Args {
        bind_addr: SocketAddr::new(ip, port),
        config_path,
        cert_chain_path,
        private_key_path,
    })
}

fn run() -> Result<(), String> {
    let args = parse_args().map_err(|err| format!("usage: wsgate <bind-address> <port> <config> <cert-chain.pem> <private-key.pem>\n{err}"))?;

    let services = ServiceRegistry::load(&args.config_path).map_err(|err| format!("failed to load service config: {err}"))?;

    let tls_server = TlsServerContext::from_pem_files(&args.cert_chain_path, &args.private_key_path)
        .map_err(|err| format!("failed to load TLS identity: {err}"))?;
    let tls_client = TlsClientContext::with_platform_roots().map_err(|err| format!("failed to build TLS client context: {err}"))?;

    let eager_upstream_drop = cfg!(feature = "eager-upstream-drop");
    let idle = IdleStrategy::Sleep(Duration::from_millis(1));

    let mut executor = Executor::start(args.bind_addr, &services, tls_server, tls_client, eager_upstream_drop, idle)
        .map_err(|err| format!("failed to start gateway: {err}"))?;

    executor.run().map_err(|err| format!("gateway reactor failed: {err}"))
}

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
