//! TLS configuration and certificate loading.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::ServerConfig;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// TLS settings for a server config, if both files are configured.
pub async fn tls_for(config: &ServerConfig) -> Result<Option<RustlsConfig>, std::io::Error> {
    match (&config.cert_file, &config.key_file) {
        (Some(cert), Some(key)) => {
            let tls = load_tls_config(Path::new(cert), Path::new(key)).await?;
            tracing::info!(cert_file = %cert, "TLS enabled");
            Ok(Some(tls))
        }
        _ => Ok(None),
    }
}
