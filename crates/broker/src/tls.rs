use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::{TlsAcceptor, rustls};

use crate::BrokerError;
use crate::server::TlsConfig;

/// Build the acceptor for a [`TlsConfig`]. Both files are PEM; a missing or
/// unparsable key is a startup failure.
pub fn create_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, BrokerError> {
    let mut cert_reader = BufReader::new(File::open(&config.certfile)?);
    let cert_chain = certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = BufReader::new(File::open(&config.keyfile)?);
    let key = private_key(&mut key_reader)?.ok_or_else(|| {
        BrokerError::Config(format!("no private key in {}", config.keyfile.display()))
    })?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| BrokerError::Config(format!("invalid certificate: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
