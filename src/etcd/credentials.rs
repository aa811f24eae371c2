//! TLS credential bundles: loading from secrets and directories, writing the
//! transport-security layout consumed by etcd.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::{DateTime, Utc};
use etcd_client::{Certificate, Identity, TlsOptions};
use k8s_openapi::api::core::v1::Secret;
use kube::Api;

use super::config::TransportSecurity;
use super::{Error, Result};

pub const KEY_FILE: &str = "tls.key";
pub const CERT_FILE: &str = "tls.crt";
pub const CA_CERT_FILE: &str = "ca.crt";

/// A private key with its certificate chain and trust anchor
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
    pub ca_cert: Vec<u8>,
    pub renew_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Load credentials from a secret following the kubernetes.io/tls layout
    pub async fn load_secret(client: kube::Client, namespace: &str, name: &str) -> Result<Credentials> {
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let secret = api.get(name).await?;

        let mut credentials = Credentials::default();
        if let Some(data) = secret.data {
            for (key, value) in data {
                match key.as_str() {
                    KEY_FILE => credentials.key = value.0,
                    CERT_FILE => credentials.cert = value.0,
                    CA_CERT_FILE => credentials.ca_cert = value.0,
                    _ => {}
                }
            }
        }

        Ok(credentials)
    }

    /// Load credentials from a directory, missing files are skipped
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Credentials> {
        let dir = dir.as_ref();

        let mut credentials = Credentials::default();
        for (name, out) in [
            (KEY_FILE, &mut credentials.key),
            (CERT_FILE, &mut credentials.cert),
            (CA_CERT_FILE, &mut credentials.ca_cert),
        ] {
            match fs::read(dir.join(name)) {
                Ok(data) => *out = data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(credentials)
    }

    /// Assemble client TLS options: identity from the key pair, roots from
    /// the CA bundle when present
    pub fn tls_options(&self) -> Result<TlsOptions> {
        if self.cert.is_empty() || self.key.is_empty() {
            return Err(Error::MissingKeyPair);
        }

        let mut tls = TlsOptions::new().identity(Identity::from_pem(&self.cert, &self.key));
        if !self.ca_cert.is_empty() {
            tls = tls.ca_certificate(Certificate::from_pem(&self.ca_cert));
        }

        Ok(tls)
    }

    /// Write key, certificate and CA into a transport-security layout.
    ///
    /// Files whose contents already match are left untouched so mtime only
    /// moves on real changes; the sidecar uses CA mtime to decide whether
    /// etcd must be restarted.
    pub fn write_transport_security(&self, ts: &TransportSecurity) -> Result<()> {
        if let Some(dir) = Path::new(&ts.key_file).parent() {
            fs::create_dir_all(dir)?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }

        let files = [
            (&ts.key_file, &self.key, 0o600),
            (&ts.cert_file, &self.cert, 0o644),
            (&ts.trusted_ca_file, &self.ca_cert, 0o644),
        ];
        for (name, data, mode) in files {
            match fs::read(name) {
                Ok(existing) if existing == **data => continue,
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }

            fs::write(name, data)?;
            fs::set_permissions(name, fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_security(dir: &Path) -> TransportSecurity {
        TransportSecurity {
            cert_file: dir.join(CERT_FILE).to_string_lossy().into_owned(),
            key_file: dir.join(KEY_FILE).to_string_lossy().into_owned(),
            trusted_ca_file: dir.join(CA_CERT_FILE).to_string_lossy().into_owned(),
            client_cert_auth: true,
            auto_tls: false,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            key: b"key".to_vec(),
            cert: b"cert".to_vec(),
            ca_cert: b"ca".to_vec(),
            renew_at: None,
        }
    }

    #[test]
    fn write_skips_unchanged_files() {
        let dir = std::env::temp_dir().join(format!("creds-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let ts = transport_security(&dir);
        let creds = credentials();

        creds.write_transport_security(&ts).unwrap();
        let before = fs::metadata(&ts.trusted_ca_file).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        creds.write_transport_security(&ts).unwrap();
        let after = fs::metadata(&ts.trusted_ca_file).unwrap().modified().unwrap();

        assert_eq!(before, after);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_dir_round_trip() {
        let dir = std::env::temp_dir().join(format!("creds-load-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let ts = transport_security(&dir);
        let creds = credentials();
        creds.write_transport_security(&ts).unwrap();

        let loaded = Credentials::load_dir(&dir).unwrap();
        assert_eq!(loaded.key, creds.key);
        assert_eq!(loaded.cert, creds.cert);
        assert_eq!(loaded.ca_cert, creds.ca_cert);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_dir_tolerates_missing_files() {
        let dir = std::env::temp_dir().join(format!("creds-missing-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let loaded = Credentials::load_dir(&dir).unwrap();
        assert!(loaded.key.is_empty());
        assert!(loaded.cert.is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tls_options_require_key_pair() {
        let creds = Credentials::default();
        assert!(matches!(creds.tls_options(), Err(Error::MissingKeyPair)));
    }
}
