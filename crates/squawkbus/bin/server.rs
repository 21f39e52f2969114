use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use squawkbus_broker::{AuthorizationSpec, Server, ServerConfig, TlsConfig};
use squawkbus_protocol::v1::DEFAULT_PORT;
use squawkbus_util::init_tracing;

/// A topic-oriented publish/subscribe message bus.
#[derive(Parser, Debug)]
#[command(name = "squawkbus")]
struct Options {
    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Serve TLS; requires --certfile and --keyfile.
    #[arg(long)]
    ssl: bool,

    /// PEM certificate chain.
    #[arg(long)]
    certfile: Option<PathBuf>,

    /// PEM private key.
    #[arg(long)]
    keyfile: Option<PathBuf>,

    /// htpasswd-style password file.
    #[arg(long)]
    passwords: Option<PathBuf>,

    /// YAML authorizations file.
    #[arg(long)]
    authorizations: Option<PathBuf>,

    /// Inline authorization spec, repeatable.
    #[arg(long = "authorization", value_name = "USER:TOPIC:ENTITLEMENTS:ROLES")]
    authorization: Vec<AuthorizationSpec>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let options = Options::parse();

    let tls = match options.ssl {
        true => {
            let (Some(certfile), Some(keyfile)) = (options.certfile, options.keyfile) else {
                anyhow::bail!("--ssl requires --certfile and --keyfile");
            };
            Some(TlsConfig { certfile, keyfile })
        }
        false => None,
    };

    let server = Server::bind(ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], options.port)),
        tls,
        password_file: options.passwords,
        authorization_file: options.authorizations,
        authorization_specs: options.authorization,
    })
    .await?;

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutting down");
        signal_shutdown.cancel();
    });

    server.serve(shutdown).await?;

    Ok(())
}
