use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context as _;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tap::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio_rustls::rustls;

pub fn install_default_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        let installed_provider = rustls::crypto::CryptoProvider::get_default();
        debug!(?installed_provider, "default crypto provider is already installed");
    }
}

/// Builds the server-side acceptor from PEM files referenced by the configuration.
pub fn build_server_acceptor(cert_pem: &str, key_pem: &str) -> anyhow::Result<tokio_rustls::TlsAcceptor> {
    let certificates = read_certificates(cert_pem).context("read TLS certificate")?;
    let private_key = read_private_key(key_pem).context("read TLS private key")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("build TLS server config")?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

/// Client configuration used when dialing backend controllers.
///
/// Verification is pinned to the controller's own CA when one is known;
/// `insecure` disables verification entirely and must stay test-only.
pub fn build_client_config(ca_pem: Option<&str>, insecure: bool) -> anyhow::Result<rustls::ClientConfig> {
    if insecure {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new()))
            .with_no_client_auth();
        return Ok(config);
    }

    let mut roots = rustls::RootCertStore::empty();

    match ca_pem {
        Some(ca_pem) => {
            for certificate in read_certificates(ca_pem).context("read controller CA certificate")? {
                roots.add(certificate).context("add CA certificate to root store")?;
            }
        }
        None => {
            let native = rustls_native_roots()?;
            roots.add_parsable_certificates(native);
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}

/// Opens a TLS stream towards `addr`, verifying against `config` for `server_name`.
pub async fn connect<S>(
    config: Arc<rustls::ClientConfig>,
    server_name: &str,
    stream: S,
) -> anyhow::Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(server_name.to_owned()).context("invalid TLS server name")?;

    let mut tls_stream = tokio_rustls::TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .context("TLS connect")?;

    // https://docs.rs/tokio-rustls/latest/tokio_rustls/#why-do-i-need-to-call-poll_flush
    tls_stream.flush().await?;

    Ok(tls_stream)
}

fn read_certificates(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("malformed certificate PEM")?
        .pipe(|certificates| {
            anyhow::ensure!(!certificates.is_empty(), "no certificate found in PEM");
            Ok(certificates)
        })
}

fn read_private_key(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());

    rustls_pemfile::private_key(&mut reader)
        .context("malformed private key PEM")?
        .context("no private key found in PEM")
}

fn rustls_native_roots() -> anyhow::Result<Vec<CertificateDer<'static>>> {
    // Backend descriptors are expected to carry their CA; the platform store
    // only backs public-certificate deployments.
    let result = rustls_native_certs::load_native_certs();

    if !result.errors.is_empty() {
        warn!(errors = ?result.errors, "Some native root certificates could not be loaded");
    }

    Ok(result.certs)
}

pub(crate) mod danger {
    use tokio_rustls::rustls;

    #[derive(Debug)]
    pub(crate) struct NoCertificateVerification(rustls::crypto::CryptoProvider);

    impl NoCertificateVerification {
        pub(crate) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls_pki_types::CertificateDer<'_>,
            _intermediates: &[rustls_pki_types::CertificateDer<'_>],
            _server_name: &rustls_pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls_pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &rustls_pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &rustls_pki_types::CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
