//! TLS as an external collaborator: wrap a socket, perform a handshake,
//! expose the peer certificate chain. Nothing else about rustls leaks past
//! this module.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::transport::Transport;

/// Whether the server asks for (and requires) a client certificate during
/// the STARTTLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    None,
    Requested,
    Required,
}

/// Wraps an accepted TCP socket, performs a TLS handshake, and hands back a
/// [`Transport`] ready to replace the session's plain one. Implementations
/// own the certificate/key material; the session only ever calls `accept`.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn accept(&self, stream: TcpStream) -> std::io::Result<Transport>;
}

/// The default [`SocketFactory`], backed by rustls.
pub struct RustlsSocketFactory {
    acceptor: tokio_rustls::TlsAcceptor,
}

impl RustlsSocketFactory {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        RustlsSocketFactory {
            acceptor: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    /// Builds a `ServerConfig` from a PEM certificate chain and private key
    /// on disk, mirroring the shape of certificate loading used throughout
    /// the rustls/tokio-rustls ecosystem, and wraps it as a factory.
    ///
    /// `client_ca_path`, when `client_auth` is `Requested` or `Required`, is
    /// the PEM bundle of CA certificates trusted to sign client
    /// certificates; it is ignored for `ClientAuth::None`.
    pub fn from_pem_files(
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
        client_auth: ClientAuth,
        client_ca_path: Option<impl AsRef<std::path::Path>>,
    ) -> anyhow::Result<Self> {
        let cert_file = std::fs::File::open(cert_path)?;
        let mut cert_reader = std::io::BufReader::new(cert_file);
        let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;

        let key_file = std::fs::File::open(key_path)?;
        let mut key_reader = std::io::BufReader::new(key_file);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| anyhow::anyhow!("no private key found in the supplied PEM file"))?;

        let builder = rustls::ServerConfig::builder();
        let config = match client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Requested | ClientAuth::Required => {
                let ca_path = client_ca_path
                    .ok_or_else(|| anyhow::anyhow!("client_ca_path is required when client_auth is not None"))?;
                let ca_file = std::fs::File::open(ca_path)?;
                let mut ca_reader = std::io::BufReader::new(ca_file);
                let mut root_store = rustls::RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut ca_reader) {
                    root_store.add(cert?)?;
                }
                let verifier_builder = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store));
                let verifier = if client_auth == ClientAuth::Requested {
                    verifier_builder.allow_unauthenticated().build()?
                } else {
                    verifier_builder.build()?
                };
                builder.with_client_cert_verifier(verifier)
            }
        };
        let config = config.with_single_cert(certs, key)?;

        Ok(Self::new(Arc::new(config)))
    }
}

#[async_trait]
impl SocketFactory for RustlsSocketFactory {
    async fn accept(&self, stream: TcpStream) -> std::io::Result<Transport> {
        let tls_stream = self.acceptor.accept(stream).await?;
        Ok(Transport::Tls(Box::new(tls_stream)))
    }
}

/// Performs the in-place STARTTLS upgrade described in spec.md §4.3: takes
/// the plain socket out of `transport`, hands it to `factory`, and installs
/// the resulting TLS stream. `transport` is left as `Transport::Upgrading`
/// only for the duration of the handshake — any I/O attempted on it during
/// that window is a bug elsewhere (the session must not be polled
/// concurrently with its own upgrade).
pub async fn upgrade(
    transport: &mut Transport,
    factory: &dyn SocketFactory,
) -> std::io::Result<()> {
    let tcp = match std::mem::replace(transport, Transport::Upgrading) {
        Transport::Plain(tcp) => tcp,
        other => {
            *transport = other;
            return Err(std::io::Error::other(
                "STARTTLS attempted on a transport that is not plain TCP",
            ));
        }
    };

    match factory.accept(tcp).await {
        Ok(upgraded) => {
            *transport = upgraded;
            Ok(())
        }
        Err(e) => Err(e),
    }
}
