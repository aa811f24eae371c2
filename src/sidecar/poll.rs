//! Poll a resource until a predicate holds.

use std::fmt::Debug;
use std::time::Duration;

use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Re-fetch `name` at `interval` until `done` returns true.
///
/// Throttling responses are absorbed and retried on the next tick; other API
/// errors propagate.
pub async fn poll<K, F>(
    api: &Api<K>,
    name: &str,
    interval: Duration,
    mut done: F,
) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    F: FnMut(&K) -> bool,
{
    loop {
        match api.get(name).await {
            Ok(obj) => {
                if done(&obj) {
                    return Ok(obj);
                }
            }
            Err(kube::Error::Api(response)) if response.code == 429 => {
                debug!(%name, "poll throttled");
            }
            Err(err) => return Err(err),
        }

        tokio::time::sleep(interval).await;
    }
}
