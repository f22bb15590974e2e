use chrono::{DateTime, Utc};

use crate::cluster::NodeAddress;

/// Counters and timestamps of the metadata refreshes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStatus {
    /// Number of refresh cycles that failed, including the ones finding no quorum.
    pub refresh_failed: u64,
    /// Number of refresh cycles that succeeded.
    pub refresh_succeeded: u64,
    /// When the last successful refresh finished.
    pub last_refresh_succeeded: Option<DateTime<Utc>>,
    /// When the last failed refresh finished.
    pub last_refresh_failed: Option<DateTime<Utc>>,
    /// Metadata server used by the last refresh that reached one.
    pub last_metadata_server: Option<NodeAddress>,
}

impl RefreshStatus {
    pub(crate) fn record_success(&mut self, metadata_server: NodeAddress) {
        self.refresh_succeeded += 1;
        self.last_refresh_succeeded = Some(Utc::now());
        self.last_metadata_server = Some(metadata_server);
    }

    pub(crate) fn record_failure(&mut self, metadata_server: Option<NodeAddress>) {
        self.refresh_failed += 1;
        self.last_refresh_failed = Some(Utc::now());
        if metadata_server.is_some() {
            self.last_metadata_server = metadata_server;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_keep_the_last_known_metadata_server() {
        let server = NodeAddress::new("md1", 3306).unwrap();
        let mut status = RefreshStatus::default();

        status.record_success(server.clone());
        status.record_failure(None);

        assert_eq!(status.refresh_succeeded, 1);
        assert_eq!(status.refresh_failed, 1);
        assert!(status.last_refresh_succeeded.is_some());
        assert!(status.last_refresh_failed >= status.last_refresh_succeeded);
        assert_eq!(status.last_metadata_server, Some(server));
    }
}
