use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::config::TlsPaths;

/// Build the acceptor for `paths`, or none when TLS is not configured.
pub fn load_tls_acceptor(paths: Option<&TlsPaths>) -> io::Result<Option<TlsAcceptor>> {
    let Some(paths) = paths else { return Ok(None) };

    let certs: Vec<_> = rustls_pemfile::certs(&mut open(&paths.cert)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "no certificates found in cert file"));
    }
    let key = rustls_pemfile::private_key(&mut open(&paths.key)?)?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn no_paths_means_plaintext() {
        assert!(load_tls_acceptor(None).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_names_the_path() {
        let paths = TlsPaths {
            cert: PathBuf::from("/nonexistent/roombook.crt"),
            key: PathBuf::from("/nonexistent/roombook.key"),
        };
        let err = load_tls_acceptor(Some(&paths)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("roombook.crt"));
    }
}
