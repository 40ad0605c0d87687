//! Request log records and the sinks that receive them.
//!
//! The orchestrator never awaits a sink on the request path; records travel
//! through the [`BackgroundQueue`](crate::core::task_queue::BackgroundQueue).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::core::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub upstream_id: Option<String>,
    pub model: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub tokens_used: i64,
    pub error_message: Option<String>,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
}

impl Default for RequestLogRecord {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            user_id: String::new(),
            api_key_id: String::new(),
            upstream_id: None,
            model: String::new(),
            method: "POST".to_string(),
            path: String::new(),
            status_code: 200,
            response_time_ms: 0,
            tokens_used: 0,
            error_message: None,
            is_streaming: false,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait RequestLogSink: Send + Sync {
    async fn record(&self, record: RequestLogRecord) -> Result<()>;
}

/// Writes each record as a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingRequestLog;

#[async_trait]
impl RequestLogSink for TracingRequestLog {
    async fn record(&self, record: RequestLogRecord) -> Result<()> {
        tracing::info!(
            request_id = %record.request_id,
            user_id = %record.user_id,
            upstream_id = record.upstream_id.as_deref().unwrap_or("-"),
            model = %record.model,
            path = %record.path,
            status = record.status_code,
            duration_ms = record.response_time_ms,
            tokens = record.tokens_used,
            streaming = record.is_streaming,
            error = record.error_message.as_deref().unwrap_or(""),
            "request completed"
        );
        Ok(())
    }
}

/// Keeps records in memory. Used by tests and by embedders that poll the log.
#[derive(Debug, Default)]
pub struct MemoryRequestLog {
    records: Mutex<Vec<RequestLogRecord>>,
}

impl MemoryRequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RequestLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl RequestLogSink for MemoryRequestLog {
    async fn record(&self, record: RequestLogRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_keeps_order() {
        let log = MemoryRequestLog::new();
        for status in [200u16, 404, 500] {
            log.record(RequestLogRecord {
                status_code: status,
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let statuses: Vec<u16> = log.records().iter().map(|r| r.status_code).collect();
        assert_eq!(statuses, vec![200, 404, 500]);
    }

    #[tokio::test]
    async fn test_tracing_log_accepts_record() {
        let log = TracingRequestLog;
        assert!(log.record(RequestLogRecord::default()).await.is_ok());
    }
}
