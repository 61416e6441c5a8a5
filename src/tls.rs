//! Mutual-TLS listener (spec §6 "All RPCs use TLS with client certificate
//! authentication").
//!
//! `rustls` + `rustls-pemfile` build a `ServerConfig` that requires and
//! verifies a client certificate against the configured CA; the accept
//! loop hands each TLS-terminated connection to axum's `Router` via
//! `hyper`'s connection builder, since axum's own `serve()` only speaks
//! plain TCP.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{error, warn};

use crate::config::TlsConfig;

pub fn build_server_config(tls: &TlsConfig) -> Result<ServerConfig, std::io::Error> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;
    let mut ca_store = RootCertStore::empty();
    for ca_cert in load_certs(&tls.ca_path)? {
        ca_store
            .add(&ca_cert)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    }

    let verifier = AllowAnyAuthenticatedClient::new(ca_store);
    ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>, std::io::Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let raw = rustls_pemfile::certs(&mut reader)?;
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey, std::io::Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found"))
}

/// Accepts mTLS connections on `addr` and serves `app` over each one.
/// Runs until the listener itself fails; individual connection errors are
/// logged and do not bring the listener down.
pub async fn serve(
    addr: std::net::SocketAddr,
    server_config: ServerConfig,
    app: axum::Router,
) -> Result<(), std::io::Error> {
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(move |req| {
                let mut app = app.clone();
                async move { app.call(req).await }
            });

            if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%peer, error = %e, "connection error");
            }
        });
    }
}
