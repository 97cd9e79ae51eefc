use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Certificate chain and key locations. TLS is all or nothing: setting
/// one path without the other is a configuration error, not plaintext.
#[derive(Debug, Clone, Copy)]
pub struct TlsPaths<'a> {
    pub cert: Option<&'a str>,
    pub key: Option<&'a str>,
}

impl<'a> TlsPaths<'a> {
    fn resolve(self) -> io::Result<Option<(&'a str, &'a str)>> {
        match (self.cert, self.key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both BARRE_TLS_CERT and BARRE_TLS_KEY must be set, or neither",
            )),
        }
    }
}

fn read_chain(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let chain: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect::<Result<_, _>>()?;
    if chain.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates in {}", path.display()),
        ));
    }
    Ok(chain)
}

fn read_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key in {}", path.display()),
        )
    })
}

/// Build the acceptor for the wire listener, or `None` for plaintext.
pub fn load_tls_acceptor(paths: TlsPaths<'_>) -> io::Result<Option<TlsAcceptor>> {
    let Some((cert, key)) = paths.resolve()? else {
        return Ok(None);
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_chain(Path::new(cert))?, read_key(Path::new(key))?)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
