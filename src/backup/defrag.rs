//! Member defragmentation with unused-space thresholds.

use std::time::Duration;

use etcd_client::TlsOptions;
use tracing::{info, warn};

use crate::etcd::connect;

use super::Result;

#[derive(Clone, Debug)]
pub struct DefragParams {
    /// Unused-to-total ratio above which a member is defragmented
    pub ratio: f64,
    /// Unused bytes above which a member is defragmented
    pub unused_size: i64,
}

impl Default for DefragParams {
    fn default() -> Self {
        Self {
            ratio: 0.7,
            unused_size: 128 * 1000 * 1000,
        }
    }
}

/// Whether a member with the given backend sizes should be defragmented
pub fn should_defrag(params: &DefragParams, db_size: i64, db_size_in_use: i64) -> bool {
    if db_size <= 0 {
        return false;
    }

    let unused = db_size - db_size_in_use;
    let ratio = unused as f64 / db_size as f64;

    unused > params.unused_size || ratio > params.ratio
}

/// Compact to the latest revision and defragment voting members over the
/// unused-space thresholds. Member failures are collected; remaining members
/// are still processed.
pub async fn defrag(
    etcd: &mut etcd_client::Client,
    tls: TlsOptions,
    timeout: Duration,
    params: DefragParams,
) -> Result<()> {
    let members = etcd.member_list().await?;

    let mut errors = Vec::new();
    for member in members.members() {
        if member.is_learner() || member.client_urls().is_empty() {
            continue;
        }
        let endpoint = &member.client_urls()[0];

        // maintenance RPCs are endpoint-scoped
        let mut member_client = match connect(tls.clone(), endpoint, timeout).await {
            Ok(client) => client,
            Err(err) => {
                warn!(%endpoint, error = %err, "connect member");
                errors.push(err.to_string());
                continue;
            }
        };

        let status = match member_client.status().await {
            Ok(status) => status,
            Err(err) => {
                warn!(%endpoint, error = %err, "member status");
                errors.push(err.to_string());
                continue;
            }
        };

        if !should_defrag(&params, status.db_size(), status.db_size_in_use()) {
            info!(%endpoint, db_size = status.db_size(), "skipped");
            continue;
        }

        let revision = status.header().map(|h| h.revision()).unwrap_or_default();
        if revision > 0 {
            if let Err(err) = etcd.compact(revision, None).await {
                warn!(%endpoint, error = %err, "compact");
                errors.push(err.to_string());
                continue;
            }
        }

        if let Err(err) = member_client.defragment().await {
            warn!(%endpoint, error = %err, "defragment");
            errors.push(err.to_string());
            continue;
        }

        info!(%endpoint, "defragmented");
    }

    if !errors.is_empty() {
        return Err(super::Error::Defrag(errors.join("; ")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defrag_above_size_threshold() {
        let params = DefragParams {
            ratio: 0.9,
            unused_size: 100,
        };
        // unused = 200 over the 100 byte threshold
        assert!(should_defrag(&params, 1000, 800));
    }

    #[test]
    fn defrag_above_ratio_threshold() {
        let params = DefragParams {
            ratio: 0.5,
            unused_size: 1 << 30,
        };
        // 60% unused exceeds the 50% ratio
        assert!(should_defrag(&params, 1000, 400));
    }

    #[test]
    fn skip_compact_backend() {
        let params = DefragParams::default();
        assert!(!should_defrag(&params, 1000, 990));
        assert!(!should_defrag(&params, 0, 0));
    }
}
