//! Generic DBMS reader/writer skeletons (spec §5) parameterized by a
//! `Querier` trait so any SQL-speaking driver can plug in without the core
//! knowing about a specific wire protocol. Grounded on the teacher's
//! `utils/database.rs::execute_in_chunks` (chunked batch exec over a
//! generic `AsyncPgConnection`) and `db_writer.rs`'s mode dispatch between
//! plain exec and explicit-transaction exec.

use crate::channel::{ChannelReceiver, ChannelSender, ReceiveBatch, SendResult};
use crate::config::ExecMode;
use crate::error::EngineError;
use crate::record::{Column, Record};
use crate::retry::{DirtySink, OneByOneWrapper, RetryClassifier, RetryWrapper};
use async_trait::async_trait;
use std::sync::Arc;

/// One bound parameter passed down to a driver's query/exec calls. Kept
/// separate from `Column` because a bind value may need driver-specific
/// typing hints the wire-level `Column` does not carry.
#[derive(Debug, Clone)]
pub enum BindValue {
    Null,
    Bool(bool),
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// The minimal surface a driver must implement to plug into the generic
/// reader/writer skeletons (spec §5: "any SQL-speaking driver... without
/// the core depending on its wire protocol").
#[async_trait]
pub trait Querier: Send + Sync {
    /// Runs a SELECT and returns the resulting rows as `Record`s.
    async fn query(&self, sql: &str, params: &[BindValue]) -> Result<Vec<Record>, EngineError>;

    /// Runs a statement that does not return rows (INSERT/UPDATE/DDL).
    async fn exec(&self, sql: &str, params: &[BindValue]) -> Result<u64, EngineError>;

    /// Begins a transaction boundary used by `ExecMode::Tx`/`StmtTx`. The
    /// returned token is passed back to `commit`/`rollback`.
    async fn begin(&self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn commit(&self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn rollback(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Fetches the `(min, max)` bounds of the split key, used to divide a
    /// table scan into per-task ranges.
    async fn fetch_split_bounds(&self, table: &str, split_key: &str) -> Result<(BindValue, BindValue), EngineError>;
}

/// Generic reader Task logic: prefer an explicit query over a
/// projection/where/split-key range, as spec §5 orders precedence.
pub struct BatchReader<Q: Querier> {
    pub querier: Arc<Q>,
    pub query_sql: Option<String>,
    pub table: Option<String>,
    pub columns: Vec<String>,
    pub where_clause: Option<String>,
    pub split_key: Option<String>,
    pub range: Option<(BindValue, BindValue)>,
}

impl<Q: Querier> BatchReader<Q> {
    fn build_sql(&self) -> Result<String, EngineError> {
        if let Some(sql) = &self.query_sql {
            return Ok(sql.clone());
        }
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| EngineError::config("batch_reader", "neither querySql nor table was provided"))?;
        let cols = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {cols} FROM {table}");
        let mut clauses = vec![];
        if let Some(w) = &self.where_clause {
            clauses.push(w.clone());
        }
        if let (Some(key), Some((_, _))) = (&self.split_key, &self.range) {
            clauses.push(format!("{key} >= ? AND {key} < ?"));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        Ok(sql)
    }

    fn range_params(&self) -> Vec<BindValue> {
        match &self.range {
            Some((lo, hi)) => vec![lo.clone(), hi.clone()],
            None => vec![],
        }
    }

    /// Streams every matching row into `sender`, flushing every
    /// `flush_every` records so the writer side observes steady progress
    /// even on a slow source.
    pub async fn run(&self, sender: ChannelSender, flush_every: usize) -> Result<u64, EngineError> {
        let sql = self.build_sql()?;
        let rows = self.querier.query(&sql, &self.range_params()).await?;
        let mut sent: u64 = 0;
        for (i, record) in rows.into_iter().enumerate() {
            match sender.send_writer(record).await {
                SendResult::Sent => sent += 1,
                SendResult::Terminated => break,
            }
            if flush_every > 0 && (i + 1) % flush_every == 0 {
                sender.flush().await;
            }
        }
        sender.terminate();
        Ok(sent)
    }
}

/// Generic writer Task logic: pulls batches and applies them under
/// `Retry(OneByOne(exec))` per `exec_mode`'s transaction strategy.
pub struct BatchWriter<Q: Querier, C: RetryClassifier> {
    pub querier: Arc<Q>,
    pub table: String,
    pub columns: Vec<String>,
    pub exec_mode: ExecMode,
    pub retry: RetryWrapper<C>,
    pub ignore_one_by_one_error: bool,
    pub dirty_quota: u64,
}

impl<Q: Querier, C: RetryClassifier> BatchWriter<Q, C> {
    fn insert_sql(&self) -> String {
        let cols = self.columns.join(", ");
        let placeholders = self.columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        format!("INSERT INTO {} ({cols}) VALUES ({placeholders})", self.table)
    }

    fn bind_row(&self, record: &Record) -> Vec<BindValue> {
        self.columns
            .iter()
            .map(|name| match record.get(name) {
                Some(Column::Bool(v)) => BindValue::Bool(*v),
                Some(Column::BigInt(v)) => BindValue::BigInt(*v),
                Some(Column::Decimal(v)) | Some(Column::String(v)) => BindValue::Text(v.clone()),
                Some(Column::Bytes(v)) => BindValue::Bytes(v.clone()),
                Some(Column::Time(v)) => BindValue::BigInt(*v),
                Some(Column::Nil) | None => BindValue::Null,
            })
            .collect()
    }

    async fn exec_batch(&self, batch: Vec<Record>) -> Result<(), EngineError> {
        let sql = self.insert_sql();
        match self.exec_mode {
            ExecMode::Tx | ExecMode::StmtTx => {
                self.querier.begin().await?;
                for record in &batch {
                    if let Err(err) = self.querier.exec(&sql, &self.bind_row(record)).await {
                        self.querier.rollback().await.ok();
                        return Err(err);
                    }
                }
                self.querier.commit().await
            },
            ExecMode::Normal | ExecMode::Stmt | ExecMode::CopyIn => {
                for record in &batch {
                    self.querier.exec(&sql, &self.bind_row(record)).await?;
                }
                Ok(())
            },
        }
    }

    async fn exec_row(&self, record: Record) -> Result<(), EngineError> {
        let sql = self.insert_sql();
        self.querier.exec(&sql, &self.bind_row(&record)).await.map(|_| ())
    }

    /// Drains `receiver` until terminated, applying each batch.
    pub async fn run(&self, receiver: ChannelReceiver, sink: &dyn DirtySink) -> Result<u64, EngineError> {
        let one_by_one = OneByOneWrapper::new(self.ignore_one_by_one_error, self.dirty_quota, sink);
        let mut applied: u64 = 0;
        loop {
            match receiver.pull_batch().await {
                ReceiveBatch::Records(batch) => {
                    let count = self
                        .retry
                        .call(|| {
                            let batch = batch.clone();
                            async {
                                one_by_one
                                    .exec(batch, |rows| self.exec_batch(rows), |row| self.exec_row(row))
                                    .await
                            }
                        })
                        .await?;
                    applied += count as u64;
                },
                ReceiveBatch::Terminated => return Ok(applied),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::config::RetryPolicy;
    use crate::retry::InMemoryDirtySink;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FakeQuerier {
        rows: Vec<Record>,
        applied: Mutex<Vec<Vec<BindValue>>>,
        fail_table_value: Option<i64>,
    }

    #[async_trait]
    impl Querier for FakeQuerier {
        async fn query(&self, _sql: &str, _params: &[BindValue]) -> Result<Vec<Record>, EngineError> {
            Ok(self.rows.clone())
        }

        async fn exec(&self, _sql: &str, params: &[BindValue]) -> Result<u64, EngineError> {
            if let (Some(poison), Some(BindValue::BigInt(v))) = (self.fail_table_value, params.first()) {
                if *v == poison {
                    return Err(EngineError::Data {
                        component: "fake".into(),
                        message: "constraint violation".into(),
                    });
                }
            }
            self.applied.lock().unwrap().push(params.to_vec());
            Ok(1)
        }

        async fn fetch_split_bounds(&self, _table: &str, _split_key: &str) -> Result<(BindValue, BindValue), EngineError> {
            Ok((BindValue::BigInt(0), BindValue::BigInt(0)))
        }
    }

    struct AlwaysRetryable;
    impl RetryClassifier for AlwaysRetryable {
        fn is_retryable(&self, _error: &EngineError) -> bool {
            true
        }
    }

    fn rec(n: i64) -> Record {
        Record::new().with_column("id", Column::BigInt(n))
    }

    #[tokio::test]
    async fn batch_reader_streams_rows_then_terminates() {
        let (tx, rx) = channel(10, 10, Duration::from_millis(50));
        let querier = Arc::new(FakeQuerier {
            rows: (0..5).map(rec).collect(),
            applied: Mutex::new(vec![]),
            fail_table_value: None,
        });
        let reader = BatchReader {
            querier,
            query_sql: Some("SELECT id FROM t".to_string()),
            table: None,
            columns: vec![],
            where_clause: None,
            split_key: None,
            range: None,
        };
        let sent = reader.run(tx, 2).await.unwrap();
        assert_eq!(sent, 5);
        let mut total = 0;
        loop {
            match rx.pull_batch().await {
                ReceiveBatch::Records(batch) => total += batch.len(),
                ReceiveBatch::Terminated => break,
            }
        }
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn batch_writer_falls_back_to_one_by_one_on_poison_row() {
        let (tx, rx) = channel(10, 10, Duration::from_millis(20));
        for i in 0..4 {
            tx.send_writer(rec(i)).await;
        }
        tx.terminate();
        let querier = Arc::new(FakeQuerier {
            rows: vec![],
            applied: Mutex::new(vec![]),
            fail_table_value: Some(2),
        });
        let writer = BatchWriter {
            querier: querier.clone(),
            table: "t".to_string(),
            columns: vec!["id".to_string()],
            exec_mode: ExecMode::Normal,
            retry: RetryWrapper::new(RetryPolicy::NoRetry, AlwaysRetryable, CancellationToken::new()),
            ignore_one_by_one_error: true,
            dirty_quota: 5,
        };
        let sink = InMemoryDirtySink::new();
        let applied = writer.run(rx, &sink).await.unwrap();
        assert_eq!(applied, 3);
        assert_eq!(sink.len(), 1);
    }
}
