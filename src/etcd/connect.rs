//! etcd gRPC client connection setup.

use std::time::Duration;

use etcd_client::{Client, ConnectOptions, TlsOptions};

use super::Result;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to a single etcd endpoint over mTLS.
///
/// `timeout` bounds every RPC issued through the returned client; the dial
/// itself is bounded separately.
pub async fn connect(tls: TlsOptions, endpoint: &str, timeout: Duration) -> Result<Client> {
    let options = ConnectOptions::new()
        .with_tls(tls)
        .with_connect_timeout(DIAL_TIMEOUT)
        .with_timeout(timeout);

    let client = Client::connect([endpoint], Some(options)).await?;
    Ok(client)
}
