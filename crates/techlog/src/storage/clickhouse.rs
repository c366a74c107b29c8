//! ClickHouse HTTP 저장소
//!
//! 모든 요청은 ClickHouse HTTP 인터페이스(`POST /?query=...`)로 전송됩니다.
//! 조회 조건 값은 `param_<name>` 쿼리 인자로 전달되고 쿼리 본문의 `{name:Type}`
//! 자리표시자에 바인딩되므로 SQL 문자열에 값이 끼워 넣어지지 않습니다.

use std::time::{Duration, Instant};

use reqwest::Client;
use uuid::Uuid;

use onecmon_core::config::StorageConfig;
use onecmon_core::metrics as m;
use onecmon_core::types::FileKey;

use super::{TECH_LOG_EVENTS_TABLE, TechLogStorage};
use crate::error::TechLogError;
use crate::event::ParsedEvent;

const BACKEND: &str = "clickhouse";

/// ClickHouse HTTP 저장소
pub struct ClickHouseStorage {
    client: Client,
    endpoint: String,
    database: String,
    user: String,
    password: String,
}

impl ClickHouseStorage {
    /// `[storage]` 설정으로 클라이언트를 생성합니다.
    ///
    /// 데이터베이스 이름은 DDL에 식별자로 들어가므로 영문자, 숫자, `_`만 허용합니다.
    pub fn new(config: &StorageConfig) -> Result<Self, TechLogError> {
        if config.url.trim().is_empty() {
            return Err(TechLogError::Config {
                field: "storage.url".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        if !is_identifier(&config.database) {
            return Err(TechLogError::Config {
                field: "storage.database".to_owned(),
                reason: format!("'{}' is not a valid identifier", config.database),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        tracing::info!(
            url = %config.url,
            database = %config.database,
            "clickhouse storage initialized"
        );

        Ok(Self {
            client,
            endpoint: format!("{}/", config.url.trim_end_matches('/')),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn table(&self) -> String {
        format!("{}.{}", self.database, TECH_LOG_EVENTS_TABLE)
    }

    /// 쿼리 하나를 실행하고 응답 본문을 반환합니다.
    async fn execute(
        &self,
        query: &str,
        params: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<String, TechLogError> {
        let mut args: Vec<(String, String)> = Vec::with_capacity(params.len() + 1);
        args.push(("query".to_owned(), query.to_owned()));
        args.extend(
            params
                .iter()
                .map(|(name, value)| (format!("param_{name}"), value.clone())),
        );

        let mut request = self
            .client
            .post(&self.endpoint)
            .query(&args)
            .header("X-ClickHouse-User", &self.user);
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TechLogError::Storage {
                backend: BACKEND.to_owned(),
                reason: format!("HTTP {status}: {}", text.trim()),
            });
        }
        Ok(text)
    }

    /// 원시 이벤트 테이블 DDL
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table}
(
    id UUID,
    start_date_time DateTime64(6, 'UTC'),
    date_time DateTime64(6, 'UTC'),
    duration Int64,
    event_name LowCardinality(String),
    level Int32,
    session_id String,
    call_id String,
    t_client_id Int32,
    dst_client_id Int32,
    usr String,
    t_connect_id String,
    t_computer_name String,
    p_process_name LowCardinality(String),
    i_name String,
    m_name String,
    locks Array(String),
    wait_connections Array(Int32),
    props Map(String, String),
    _agent_id UUID,
    _seance_id UUID,
    _template_id UUID,
    _folder String,
    _file String,
    _end_position Int64,
    INDEX for_calls_chain (event_name, t_client_id, call_id) TYPE minmax GRANULARITY 3
)
ENGINE = MergeTree
PARTITION BY (toYYYYMMDD(date_time), event_name)
ORDER BY (_end_position, event_name)",
            table = self.table()
        )
    }
}

impl TechLogStorage for ClickHouseStorage {
    async fn init_schema(&self) -> Result<(), TechLogError> {
        self.execute(
            &format!("CREATE DATABASE IF NOT EXISTS {}", self.database),
            &[],
            None,
        )
        .await?;
        self.execute(&self.create_table_sql(), &[], None).await?;
        tracing::info!(table = %self.table(), "clickhouse schema ready");
        Ok(())
    }

    async fn bulk_insert(&self, events: &[ParsedEvent]) -> Result<(), TechLogError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut body = Vec::with_capacity(events.len() * 512);
        for event in events {
            serde_json::to_writer(&mut body, event)?;
            body.push(b'\n');
        }

        let started = Instant::now();
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.table());
        self.execute(&query, &[], Some(body)).await?;
        metrics::histogram!(m::STORAGE_BULK_INSERT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        tracing::debug!(events = events.len(), "bulk insert completed");
        Ok(())
    }

    async fn query_last_position(&self, agent_id: Uuid, key: &FileKey) -> Result<i64, TechLogError> {
        let query = format!(
            "SELECT max(_end_position) FROM {} \
             WHERE _agent_id = {{agent:UUID}} \
             AND _seance_id = {{seance:UUID}} \
             AND _template_id = {{template:UUID}} \
             AND _folder = {{folder:String}} \
             AND _file = {{file:String}} \
             FORMAT TabSeparated",
            self.table()
        );
        let params = [
            ("agent", agent_id.to_string()),
            ("seance", key.seance_id.to_string()),
            ("template", key.template_id.to_string()),
            ("folder", key.folder.clone()),
            ("file", key.file.clone()),
        ];

        let text = self.execute(&query, &params, None).await?;
        let value = text.trim();
        if value.is_empty() {
            return Ok(0);
        }
        value.parse::<i64>().map_err(|_| TechLogError::Storage {
            backend: BACKEND.to_owned(),
            reason: format!("unexpected position response '{value}'"),
        })
    }

    async fn delete_seance_data(&self, seance_id: Uuid) -> Result<(), TechLogError> {
        let query = format!(
            "ALTER TABLE {} DELETE WHERE _seance_id = {{seance:UUID}}",
            self.table()
        );
        self.execute(&query, &[("seance", seance_id.to_string())], None)
            .await?;
        tracing::info!(seance_id = %seance_id, "deleted seance data");
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !name.as_bytes()[0].is_ascii_digit()
}
