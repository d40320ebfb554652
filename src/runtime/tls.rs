use std::{
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate,
    OwnedTrustAnchor,
    PrivateKey,
    RootCertStore,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    client::options::TlsOptions,
    error::{Error, ErrorKind, Result},
};

/// A TLS session over a TCP connection to a server.
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// A ready-to-use TLS connector. Building one parses certificate files and constructs a rustls
/// config, so it is created once per client and shared by every connection.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    pub(crate) fn new(options: TlsOptions) -> Result<TlsConfig> {
        let roots = root_certificates(options.ca_file_path.as_deref())?;

        let builder = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);

        let mut config = match options.cert_key_file_path {
            Some(ref path) => {
                let (chain, key) = client_identity(path)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| config_error(format!("invalid client certificate: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        config.enable_sni = true;
        if options.allow_invalid_certificates == Some(true) {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
        }

        Ok(TlsConfig {
            connector: Arc::new(config).into(),
        })
    }

    /// Runs the TLS handshake for `host` over an established TCP stream.
    pub(crate) async fn wrap(&self, host: &str, tcp_stream: TcpStream) -> Result<TlsStream> {
        let name = ServerName::try_from(host).map_err(|e| {
            Error::invalid_argument(format!("{:?} is not a valid TLS server name: {}", host, e))
        })?;

        let stream = self
            .connector
            .connect_with(name, tcp_stream, |conn| {
                conn.set_buffer_limit(None);
            })
            .await?;
        Ok(stream)
    }
}

fn config_error(message: String) -> Error {
    ErrorKind::InvalidTlsConfig { message }.into()
}

/// The trust roots: the given CA file when configured, the bundled Mozilla roots otherwise.
fn root_certificates(ca_file: Option<&std::path::Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            let ders = rustls_pemfile::certs(&mut BufReader::new(File::open(path)?))
                .map_err(|_| {
                    config_error(format!(
                        "unable to parse PEM-encoded root certificates from {}",
                        path.display()
                    ))
                })?;
            roots.add_parsable_certificates(&ders);
        }
        None => {
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    anchor.subject,
                    anchor.spki,
                    anchor.name_constraints,
                )
            }));
        }
    }

    Ok(roots)
}

/// The client's certificate chain and private key, both read from the one PEM file.
fn client_identity(path: &std::path::Path) -> Result<(Vec<Certificate>, PrivateKey)> {
    let mut file = BufReader::new(File::open(path)?);

    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut file)
        .map_err(|_| {
            config_error(format!(
                "unable to parse PEM-encoded client certificate from {}",
                path.display()
            ))
        })?
        .into_iter()
        .map(Certificate)
        .collect();

    file.seek(SeekFrom::Start(0))?;
    let key = loop {
        use rustls_pemfile::Item;
        match rustls_pemfile::read_one(&mut file) {
            Ok(Some(Item::PKCS8Key(bytes) | Item::RSAKey(bytes))) => break PrivateKey(bytes),
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(config_error(format!(
                    "no PEM-encoded private key found in {}",
                    path.display()
                )))
            }
            Err(_) => {
                return Err(config_error(format!(
                    "unable to parse PEM-encoded item from {}",
                    path.display()
                )))
            }
        }
    };

    Ok((chain, key))
}

/// A verifier that accepts whatever the server presents, for
/// `tlsAllowInvalidCertificates=true`.
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
