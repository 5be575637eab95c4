//! Relational connection (spec.md §6.1): a short-lived session executing
//! parameterless SQL against a fixed set of diagnostic views. The substrate
//! under the Relational DMV Sampler (C5). Real impl wraps `tiberius`,
//! driven by a small dedicated Tokio runtime per tick (teacher precedent:
//! `PostgresCollector`'s short-lived-connection-per-poll design).

use std::collections::HashMap;
use std::fmt;

#[derive(Debug)]
pub enum DmvError {
    Connect(String),
    Query(String),
}

impl fmt::Display for DmvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmvError::Connect(msg) => write!(f, "failed to connect: {}", msg),
            DmvError::Query(msg) => write!(f, "query failed: {}", msg),
        }
    }
}

impl std::error::Error for DmvError {}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Column {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl Column {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Column::Int(v) => Some(*v),
            Column::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Column::Int(v) => Some(*v as f64),
            Column::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Column::Str(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Row {
    pub columns: HashMap<String, Column>,
}

impl Row {
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }
}

pub trait RelationalConnection: Send {
    fn query_row(&mut self, sql: &str) -> Result<Option<Row>, DmvError>;
    fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>, DmvError>;
}

/// Opens a fresh connection; the Relational DMV Sampler calls this once per
/// tick rather than holding a long-lived connection (spec.md §4.5).
pub trait RelationalConnector: Send + Sync {
    fn connect(&self, conn_str: &str) -> Result<Box<dyn RelationalConnection>, DmvError>;
}

#[cfg(windows)]
pub use real::TiberiusConnector;

#[cfg(windows)]
mod real {
    use super::*;
    use futures::TryStreamExt;
    use tiberius::{Client, Config as TiberiusConfig};
    use tokio::net::TcpStream;
    use tokio_util::compat::TokioAsyncWriteCompatExt;

    /// Drives a dedicated single-threaded Tokio runtime, matching the
    /// teacher's short-lived-connection-per-poll design rather than sharing
    /// the Orchestrator's runtime for database I/O.
    pub struct TiberiusConnector;

    impl Default for TiberiusConnector {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TiberiusConnector {
        pub fn new() -> Self {
            Self
        }
    }

    impl RelationalConnector for TiberiusConnector {
        fn connect(&self, conn_str: &str) -> Result<Box<dyn RelationalConnection>, DmvError> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| DmvError::Connect(e.to_string()))?;

            let conn_str = conn_str.to_string();
            let client = runtime.block_on(async move {
                let config = TiberiusConfig::from_ado_string(&conn_str).map_err(|e| DmvError::Connect(e.to_string()))?;
                let tcp = TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| DmvError::Connect(e.to_string()))?;
                tcp.set_nodelay(true).ok();
                Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(|e| DmvError::Connect(e.to_string()))
            })?;

            Ok(Box::new(RealConnection { runtime, client }))
        }
    }

    struct RealConnection {
        runtime: tokio::runtime::Runtime,
        client: Client<tokio_util::compat::Compat<TcpStream>>,
    }

    fn column_from_tiberius(row: &tiberius::Row, idx: usize) -> Column {
        if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
            return Column::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
            return Column::Int(v as i64);
        }
        if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
            return Column::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
            return Column::Str(v.to_string());
        }
        Column::Null
    }

    fn to_row(src: tiberius::Row) -> Row {
        let mut columns = HashMap::new();
        for (idx, col) in src.columns().iter().enumerate() {
            columns.insert(col.name().to_string(), column_from_tiberius(&src, idx));
        }
        Row { columns }
    }

    impl RelationalConnection for RealConnection {
        fn query_row(&mut self, sql: &str) -> Result<Option<Row>, DmvError> {
            let sql = sql.to_string();
            let client = &mut self.client;
            self.runtime.block_on(async move {
                let stream = client.simple_query(sql).await.map_err(|e| DmvError::Query(e.to_string()))?;
                let rows: Vec<tiberius::Row> = stream.into_first_result().await.map_err(|e| DmvError::Query(e.to_string()))?;
                Ok(rows.into_iter().next().map(to_row))
            })
        }

        fn query_rows(&mut self, sql: &str) -> Result<Vec<Row>, DmvError> {
            let sql = sql.to_string();
            let client = &mut self.client;
            self.runtime.block_on(async move {
                let stream = client.simple_query(sql).await.map_err(|e| DmvError::Query(e.to_string()))?;
                let rows: Vec<tiberius::Row> = stream.try_collect().await.map_err(|e| DmvError::Query(e.to_string()))?;
                Ok(rows.into_iter().map(to_row).collect())
            })
        }
    }
}

/// Scripted connector for tests: returns a queue of rows per query. The
/// queue is shared (not reset) across successive `connect()` calls, since
/// the Relational DMV Sampler (C5) opens a fresh connection every tick and
/// tests script a sequence of ticks' worth of query results up front.
#[derive(Default)]
pub struct MockRelationalConnector {
    rows: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Vec<Row>>>>,
    fail_connect: std::sync::Mutex<bool>,
}

impl MockRelationalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(self, rows: Vec<Row>) -> Self {
        self.rows.lock().unwrap().push_back(rows);
        self
    }

    pub fn failing_to_connect(self) -> Self {
        *self.fail_connect.lock().unwrap() = true;
        self
    }
}

impl RelationalConnector for MockRelationalConnector {
    fn connect(&self, _conn_str: &str) -> Result<Box<dyn RelationalConnection>, DmvError> {
        if *self.fail_connect.lock().unwrap() {
            return Err(DmvError::Connect("scripted failure".to_string()));
        }
        Ok(Box::new(MockConnection {
            queue: std::sync::Arc::clone(&self.rows),
        }))
    }
}

struct MockConnection {
    queue: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Vec<Row>>>>,
}

impl RelationalConnection for MockConnection {
    fn query_row(&mut self, _sql: &str) -> Result<Option<Row>, DmvError> {
        Ok(self.queue.lock().unwrap().pop_front().and_then(|rows| rows.into_iter().next()))
    }

    fn query_rows(&mut self, _sql: &str) -> Result<Vec<Row>, DmvError> {
        Ok(self.queue.lock().unwrap().pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Column)]) -> Row {
        Row {
            columns: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn mock_connector_replays_results_in_order() {
        let connector = MockRelationalConnector::new()
            .push_result(vec![row(&[("active_requests", Column::Int(3))])])
            .push_result(vec![]);
        let mut conn = connector.connect("dummy").unwrap();

        let first = conn.query_row("SELECT 1").unwrap().unwrap();
        assert_eq!(first.get("active_requests").unwrap().as_i64(), Some(3));

        let second = conn.query_row("SELECT 1").unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn mock_connector_fails_to_connect_when_scripted() {
        let connector = MockRelationalConnector::new().failing_to_connect();
        assert!(connector.connect("dummy").is_err());
    }
}
