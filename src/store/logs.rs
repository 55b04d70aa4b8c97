use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use serde::Serialize;

use super::{Store, StoreError};

/// One immutable row per terminated request.
#[derive(Clone, Debug, Serialize)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub request_time: f64,
    pub principal_alias: String,
    pub key_identifier: String,
    pub key_brief: Option<String>,
    pub model_name: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub is_success: bool,
    pub error_kind: Option<String>,
    pub dialect: String,
    pub streamed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub principal_alias: Option<String>,
    pub key_identifier: Option<String>,
    pub model_name: Option<String>,
    pub is_success: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogPage {
    pub logs: Vec<RequestLogRecord>,
    pub total: u64,
    /// `[min, max]` request_time over the whole table, for UI time pickers.
    pub time_range: Option<(f64, f64)>,
}

fn filter_clause(filter: &LogFilter) -> (String, Vec<Value>) {
    let mut clause = String::from("WHERE 1=1");
    let mut params = Vec::<Value>::new();

    if let Some(start) = filter.start_time {
        clause.push_str(" AND request_time >= ?");
        params.push(Value::Real(start));
    }
    if let Some(end) = filter.end_time {
        clause.push_str(" AND request_time <= ?");
        params.push(Value::Real(end));
    }
    if let Some(alias) = &filter.principal_alias {
        clause.push_str(" AND principal_alias = ?");
        params.push(Value::Text(alias.clone()));
    }
    if let Some(identifier) = &filter.key_identifier {
        clause.push_str(" AND key_identifier = ?");
        params.push(Value::Text(identifier.clone()));
    }
    if let Some(model) = &filter.model_name {
        clause.push_str(" AND model_name = ?");
        params.push(Value::Text(model.clone()));
    }
    if let Some(is_success) = filter.is_success {
        clause.push_str(" AND is_success = ?");
        params.push(Value::Integer(i64::from(is_success)));
    }

    (clause, params)
}

impl Store {
    pub async fn insert_request_log(&self, record: RequestLogRecord) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO request_logs (
                     request_id, request_time, principal_alias, key_identifier,
                     key_brief, model_name, prompt_tokens, completion_tokens,
                     total_tokens, is_success, error_kind, dialect, streamed
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    record.request_id,
                    record.request_time,
                    record.principal_alias,
                    record.key_identifier,
                    record.key_brief,
                    record.model_name,
                    record.prompt_tokens.map(|v| v as i64),
                    record.completion_tokens.map(|v| v as i64),
                    record.total_tokens.map(|v| v as i64),
                    record.is_success as i64,
                    record.error_kind,
                    record.dialect,
                    record.streamed as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn query_request_logs(&self, filter: LogFilter) -> Result<LogPage, StoreError> {
        self.call(move |conn| {
            let (clause, params) = filter_clause(&filter);

            let count_sql = format!("SELECT COUNT(*) FROM request_logs {clause}");
            let total: i64 = conn.query_row(
                &count_sql,
                rusqlite::params_from_iter(params.iter().cloned()),
                |row| row.get(0),
            )?;

            let page_sql = format!(
                "SELECT request_id, request_time, principal_alias, key_identifier,
                        key_brief, model_name, prompt_tokens, completion_tokens,
                        total_tokens, is_success, error_kind, dialect, streamed
                 FROM request_logs {clause}
                 ORDER BY request_time DESC
                 LIMIT ? OFFSET ?"
            );
            let mut page_params = params;
            page_params.push(Value::Integer(i64::from(filter.limit.max(1))));
            page_params.push(Value::Integer(i64::from(filter.offset)));

            let mut stmt = conn.prepare(&page_sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(page_params), |row| {
                Ok(RequestLogRecord {
                    request_id: row.get(0)?,
                    request_time: row.get(1)?,
                    principal_alias: row.get(2)?,
                    key_identifier: row.get(3)?,
                    key_brief: row.get(4)?,
                    model_name: row.get(5)?,
                    prompt_tokens: row.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
                    completion_tokens: row.get::<_, Option<i64>>(7)?.map(|v| v.max(0) as u64),
                    total_tokens: row.get::<_, Option<i64>>(8)?.map(|v| v.max(0) as u64),
                    is_success: row.get::<_, i64>(9)? != 0,
                    error_kind: row.get(10)?,
                    dialect: row.get(11)?,
                    streamed: row.get::<_, i64>(12)? != 0,
                })
            })?;
            let mut logs = Vec::new();
            for row in rows {
                logs.push(row?);
            }

            let time_range: Option<(f64, f64)> = conn
                .query_row(
                    "SELECT MIN(request_time), MAX(request_time) FROM request_logs",
                    [],
                    |row| {
                        Ok(match (row.get::<_, Option<f64>>(0)?, row.get::<_, Option<f64>>(1)?) {
                            (Some(min), Some(max)) => Some((min, max)),
                            _ => None,
                        })
                    },
                )
                .optional()?
                .flatten();

            Ok(LogPage {
                logs,
                total: total.max(0) as u64,
                time_range,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::now_epoch;

    fn log(alias: &str, model: &str, success: bool, time: f64) -> RequestLogRecord {
        RequestLogRecord {
            request_id: format!("rotor-{time}-{alias}"),
            request_time: time,
            principal_alias: alias.to_string(),
            key_identifier: "key_sha256_aabbccdd".to_string(),
            key_brief: Some("sk-u...d123".to_string()),
            model_name: model.to_string(),
            prompt_tokens: success.then_some(10),
            completion_tokens: success.then_some(5),
            total_tokens: success.then_some(15),
            is_success: success,
            error_kind: (!success).then(|| "upstream_5xx".to_string()),
            dialect: "gemini".to_string(),
            streamed: false,
        }
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = super::super::Store::open(dir.path().join("rotor.sqlite")).expect("open");

        let base = now_epoch();
        for i in 0..5 {
            store
                .insert_request_log(log("alice", "m1", true, base + f64::from(i)))
                .await
                .expect("insert");
        }
        store
            .insert_request_log(log("bob", "m2", false, base + 10.0))
            .await
            .expect("insert");

        let page = store
            .query_request_logs(LogFilter {
                principal_alias: Some("alice".to_string()),
                limit: 2,
                ..LogFilter::default()
            })
            .await
            .expect("query");
        assert_eq!(page.total, 5);
        assert_eq!(page.logs.len(), 2);
        // Newest first.
        assert_eq!(page.logs[0].request_time, base + 4.0);
        let range = page.time_range.expect("range");
        assert_eq!(range.0, base);
        assert_eq!(range.1, base + 10.0);

        let failures = store
            .query_request_logs(LogFilter {
                is_success: Some(false),
                limit: 10,
                ..LogFilter::default()
            })
            .await
            .expect("query");
        assert_eq!(failures.total, 1);
        assert_eq!(failures.logs[0].principal_alias, "bob");
        assert_eq!(failures.logs[0].error_kind.as_deref(), Some("upstream_5xx"));
    }

    #[tokio::test]
    async fn time_window_filter_bounds_inclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = super::super::Store::open(dir.path().join("rotor.sqlite")).expect("open");

        store
            .insert_request_log(log("alice", "m1", true, 100.0))
            .await
            .expect("insert");
        store
            .insert_request_log(log("alice", "m1", true, 200.0))
            .await
            .expect("insert");

        let page = store
            .query_request_logs(LogFilter {
                start_time: Some(100.0),
                end_time: Some(150.0),
                limit: 10,
                ..LogFilter::default()
            })
            .await
            .expect("query");
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].request_time, 100.0);
    }
}
