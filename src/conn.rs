//! Transport establishment: endpoint addressing, TCP/TLS/unix dial with a
//! connect timeout, stream halves, rustls client configuration.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::SignatureScheme;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{ClientOptions, TlsOptions};
use crate::error::{LdapError, Result};

/// Where the client connects.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Endpoint {
    Tcp {
        host: String,
        port: u16,
        tls: bool,
    },
    #[cfg(unix)]
    Unix { path: String },
}

impl Endpoint {
    /// Endpoint from options: `url` and `socket_path` are mutually
    /// exclusive, one of them is required.
    pub(crate) fn from_options(opts: &ClientOptions) -> Result<Self> {
        match (&opts.url, &opts.socket_path) {
            (Some(_), Some(_)) => Err(LdapError::InvalidArgument(
                "url and socket_path are mutually exclusive".to_string(),
            )),
            (Some(url), None) => Endpoint::parse_url(url),
            #[cfg(unix)]
            (None, Some(path)) => Ok(Endpoint::Unix { path: path.clone() }),
            #[cfg(not(unix))]
            (None, Some(_)) => Err(LdapError::InvalidArgument(
                "socket_path is not supported on this platform".to_string(),
            )),
            (None, None) => Err(LdapError::InvalidArgument(
                "either url or socket_path is required".to_string(),
            )),
        }
    }

    /// Parse "ldap://host[:port]" or "ldaps://host[:port]"; default ports
    /// 389 and 636.
    fn parse_url(url: &str) -> Result<Self> {
        let (rest, tls) = if let Some(rest) = url.strip_prefix("ldap://") {
            (rest, false)
        } else if let Some(rest) = url.strip_prefix("ldaps://") {
            (rest, true)
        } else {
            return Err(LdapError::InvalidArgument(format!(
                "invalid URL scheme, expected ldap:// or ldaps://: {}",
                url
            )));
        };
        let rest = rest.trim_start_matches('/').trim_end_matches('/');
        if rest.is_empty() {
            return Err(LdapError::InvalidArgument(format!("no host in URL: {}", url)));
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) if !port_str.is_empty() && !host.is_empty() => {
                let port: u16 = port_str.parse().map_err(|_| {
                    LdapError::InvalidArgument(format!("invalid port in URL: {}", url))
                })?;
                (host.to_string(), port)
            }
            _ => (rest.to_string(), if tls { 636 } else { 389 }),
        };
        Ok(Endpoint::Tcp { host, port, tls })
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Endpoint::Tcp { tls: true, .. })
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { host, port, tls } => {
                format!("{}://{}:{}", if *tls { "ldaps" } else { "ldap" }, host, port)
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => format!("ldapi://{}", path),
        }
    }
}

/// Connected byte stream: plain TCP, TLS over TCP, or a unix socket.
pub(crate) enum ClientStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    pub(crate) fn into_split(self) -> (StreamReadHalf, StreamWriteHalf) {
        match self {
            ClientStream::Tcp(s) => {
                let (r, w) = s.into_split();
                (StreamReadHalf::Tcp(r), StreamWriteHalf::Tcp(w))
            }
            ClientStream::Tls(s) => {
                let (r, w) = tokio::io::split(*s);
                (StreamReadHalf::Tls(r), StreamWriteHalf::Tls(w))
            }
            #[cfg(unix)]
            ClientStream::Unix(s) => {
                let (r, w) = s.into_split();
                (StreamReadHalf::Unix(r), StreamWriteHalf::Unix(w))
            }
        }
    }
}

pub(crate) enum StreamReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    Tls(tokio::io::ReadHalf<ClientTlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
}

pub(crate) enum StreamWriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<ClientTlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
}

impl AsyncRead for StreamReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            StreamReadHalf::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            StreamReadHalf::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            StreamReadHalf::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamWriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            StreamWriteHalf::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            StreamWriteHalf::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            StreamWriteHalf::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            StreamWriteHalf::Tcp(s) => Pin::new(s).poll_flush(cx),
            StreamWriteHalf::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            StreamWriteHalf::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            StreamWriteHalf::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            StreamWriteHalf::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            StreamWriteHalf::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dial failure, distinguishing the connect timeout for event reporting.
pub(crate) struct DialError {
    pub timed_out: bool,
    pub error: LdapError,
}

/// One connection attempt. `tls_config` must be present for ldaps
/// endpoints.
pub(crate) async fn dial(
    endpoint: &Endpoint,
    tls_config: Option<Arc<ClientConfig>>,
    connect_timeout: Option<Duration>,
) -> std::result::Result<ClientStream, DialError> {
    let attempt = dial_inner(endpoint, tls_config);
    match connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome.map_err(|error| DialError {
                timed_out: false,
                error,
            }),
            Err(_) => Err(DialError {
                timed_out: true,
                error: LdapError::Connection("connection timeout".to_string()),
            }),
        },
        None => attempt.await.map_err(|error| DialError {
            timed_out: false,
            error,
        }),
    }
}

async fn dial_inner(
    endpoint: &Endpoint,
    tls_config: Option<Arc<ClientConfig>>,
) -> Result<ClientStream> {
    match endpoint {
        Endpoint::Tcp { host, port, tls } => {
            let addr = format!("{}:{}", host, port);
            let tcp = TcpStream::connect(&addr).await.map_err(|e| {
                LdapError::Connection(format!("failed to connect to {}: {}", addr, e))
            })?;
            if !tls {
                return Ok(ClientStream::Tcp(tcp));
            }
            let config = tls_config.ok_or_else(|| {
                LdapError::Connection("missing TLS configuration for ldaps endpoint".to_string())
            })?;
            let connector = TlsConnector::from(config);
            let server_name = ServerName::try_from(host.clone()).map_err(|_| {
                LdapError::Connection(format!("invalid hostname for TLS SNI: {}", host))
            })?;
            let stream = connector.connect(server_name, tcp).await.map_err(|e| {
                LdapError::Connection(format!("TLS handshake to {} failed: {}", addr, e))
            })?;
            Ok(ClientStream::Tls(Box::new(stream)))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let stream = UnixStream::connect(path).await.map_err(|e| {
                LdapError::Connection(format!("failed to connect to {}: {}", path, e))
            })?;
            Ok(ClientStream::Unix(stream))
        }
    }
}

/// Verifier that accepts any server certificate. Only used with
/// `TlsOptions::skip_verify` (internal/test deployments).
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build the rustls client config: system roots plus any configured extra
/// CA PEM; certificate verification disabled only when `skip_verify` is set.
pub(crate) fn build_tls_config(opts: &TlsOptions) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = root_store.add(cert);
    }
    if let Some(pem) = &opts.extra_ca_pem {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem.as_bytes())) {
            let cert = cert
                .map_err(|e| LdapError::InvalidArgument(format!("invalid CA PEM: {}", e)))?;
            let _ = root_store.add(cert);
        }
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if opts.skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    }
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(url: &str) -> Endpoint {
        Endpoint::parse_url(url).unwrap()
    }

    #[test]
    fn parse_plain_url() {
        assert_eq!(
            tcp("ldap://localhost:1389"),
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 1389,
                tls: false,
            }
        );
    }

    #[test]
    fn parse_default_ports() {
        assert_eq!(
            tcp("ldap://ldap.example.com"),
            Endpoint::Tcp {
                host: "ldap.example.com".to_string(),
                port: 389,
                tls: false,
            }
        );
        assert_eq!(
            tcp("ldaps://ldap.example.com"),
            Endpoint::Tcp {
                host: "ldap.example.com".to_string(),
                port: 636,
                tls: true,
            }
        );
    }

    #[test]
    fn parse_rejects_bad_urls() {
        assert!(Endpoint::parse_url("http://x:1").is_err());
        assert!(Endpoint::parse_url("ldap://").is_err());
        assert!(Endpoint::parse_url("ldap://host:notaport").is_err());
        assert!(Endpoint::parse_url("ldap://host:99999").is_err());
    }

    #[test]
    fn options_require_exactly_one_endpoint() {
        let none = ClientOptions::default();
        assert!(Endpoint::from_options(&none).is_err());

        let both = ClientOptions {
            url: Some("ldap://a:389".to_string()),
            socket_path: Some("/run/ldapi".to_string()),
            ..Default::default()
        };
        assert!(Endpoint::from_options(&both).is_err());

        let url_only = ClientOptions {
            url: Some("ldap://a:389".to_string()),
            ..Default::default()
        };
        assert!(Endpoint::from_options(&url_only).is_ok());
    }

    #[test]
    fn describe_round_trips_scheme() {
        assert_eq!(tcp("ldap://h:389").describe(), "ldap://h:389");
        assert_eq!(tcp("ldaps://h").describe(), "ldaps://h:636");
    }
}
