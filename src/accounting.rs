//! Execution Accounting
//!
//! When enabled, every request ships one log line per worker to a
//! date-keyed object under the stats account, via an append-style
//! POST. Shipping is fire-and-forget; failures are logged and never
//! affect the client response.

use std::sync::Arc;

use chrono::Utc;

use crate::config::AccountingConfig;
use crate::storage::StorageBackend;

/// Append the collected per-worker lines to today's accounting log
pub async fn ship_cdr_log(
    storage: Arc<dyn StorageBackend>,
    accounting: AccountingConfig,
    account: String,
    lines: Vec<String>,
) {
    if lines.is_empty() {
        return;
    }
    let object = Utc::now().format("%Y/%m/%d.log");
    let path = format!(
        "/{}/{}/{}/{}",
        accounting.version, accounting.cdr_account, account, object
    );
    let body = lines.concat();
    match storage.append_log(&path, body).await {
        Ok(status) if status < 300 => {}
        Ok(status) => {
            tracing::warn!(
                "Cannot write stats for account {}: status {}",
                account,
                status
            );
        }
        Err(e) => {
            tracing::warn!("Cannot write stats for account {}: {}", account, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::planner::ObjectLister;
    use crate::storage::{BackendHost, ByteStream, ContainerInfo, ObjectResponse};
    use async_trait::async_trait;
    use regex::Regex;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStorage {
        appended: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ObjectLister for RecordingStorage {
        async fn list_account(&self, _: &str, _: &Regex) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_container(
            &self,
            _: &str,
            _: &str,
            _: Option<&Regex>,
        ) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl StorageBackend for RecordingStorage {
        fn replica_count(&self) -> u32 {
            1
        }

        fn partition_count(&self) -> u64 {
            1
        }

        fn partition_for(&self, _: &str, _: &str, _: &str) -> u64 {
            0
        }

        fn hosts_for_partition(&self, _: u64) -> Vec<BackendHost> {
            Vec::new()
        }

        async fn get_object(&self, path: &str, _: bool, _: bool) -> Result<ObjectResponse> {
            Err(crate::error::Error::Storage(path.to_string()))
        }

        async fn put_object(
            &self,
            _: &str,
            _: &str,
            _: &HashMap<String, String>,
            _: u64,
            _: ByteStream,
        ) -> Result<u16> {
            Ok(201)
        }

        async fn append_log(&self, path: &str, body: String) -> Result<u16> {
            self.appended
                .lock()
                .unwrap()
                .push((path.to_string(), body));
            Ok(200)
        }

        async fn container_info(&self, _: &str, _: &str) -> Result<ContainerInfo> {
            Ok(ContainerInfo::default())
        }
    }

    #[tokio::test]
    async fn test_ship_appends_dated_log() {
        let storage = Arc::new(RecordingStorage::default());
        let accounting = AccountingConfig {
            enabled: true,
            cdr_account: "userstats".to_string(),
            version: "v1".to_string(),
        };
        ship_cdr_log(
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
            accounting,
            "acc".to_string(),
            vec!["line one\n".to_string(), "line two\n".to_string()],
        )
        .await;
        let appended = storage.appended.lock().unwrap();
        assert_eq!(appended.len(), 1);
        let (path, body) = &appended[0];
        assert!(path.starts_with("/v1/userstats/acc/"));
        assert!(path.ends_with(".log"));
        assert_eq!(body, "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_ship_skips_empty_batches() {
        let storage = Arc::new(RecordingStorage::default());
        let accounting = AccountingConfig::default();
        ship_cdr_log(
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
            accounting,
            "acc".to_string(),
            Vec::new(),
        )
        .await;
        assert!(storage.appended.lock().unwrap().is_empty());
    }
}
