//! Server end-to-end tests.
//!
//! A real server runs on an ephemeral port with the in-memory backend; the client side
//! is an initiator `Connection`, the same one the agent uses.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use onecmon_core::config::OnecmonConfig;
use onecmon_core::types::{
    AgentInstance, FileKey, LastFilePositionRequest, TechLogEventContent, TechLogSeance,
};
use onecmon_protocol::{Connection, ConnectionConfig, MessageType};
use onecmon_server::orchestrator::ServerOrchestrator;
use onecmon_techlog::{EventReader, ParsedEvent, StorageBackend};

const AGENT: &str = "0b8e5f0c-31c1-4a6e-8d0a-5d7c7f3a2b10";
const SEANCE: &str = "6f1c2a4e-0d3b-4c55-9a57-2b0e7b1f9c11";
const TEMPLATE: &str = "a3d4c7e2-5b61-4f0e-b1c9-8e2f6d9a7c33";

const BODY: &str = "12:34.100000-500,EXCP,1,Descr='boom'\n\
                    12:34.200000-100,CONN,0,Usr=admin\n";

struct RunningServer {
    orchestrator: JoinHandle<anyhow::Result<()>>,
    stop: oneshot::Sender<()>,
    port: u16,
    storage: Arc<StorageBackend>,
}

impl RunningServer {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        timeout(Duration::from_secs(10), self.orchestrator)
            .await
            .expect("server did not stop in time")
            .unwrap()
            .unwrap();
    }

    async fn events(&self) -> Vec<ParsedEvent> {
        match self.storage.as_ref() {
            StorageBackend::Memory(memory) => memory.events().await,
            _ => panic!("tests run on the memory backend"),
        }
    }

    async fn wait_for_events(&self, count: usize) -> Vec<ParsedEvent> {
        for _ in 0..100 {
            let events = self.events().await;
            if events.len() >= count {
                return events;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {count} stored events, got {}", self.events().await.len());
    }
}

fn server_config(seances_path: Option<&Path>) -> OnecmonConfig {
    let mut config = OnecmonConfig::default();
    config.general.pid_file = String::new();
    config.server.bind_addr = "127.0.0.1:0".to_owned();
    config.server.seances_reload_secs = 1;
    config.server.seances_path = seances_path
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    config.storage.backend = "memory".to_owned();
    config.pipeline.parse_workers = 2;
    config.pipeline.flush_interval_ms = 50;
    config.metrics.enabled = false;
    config
}

async fn start_server(config: OnecmonConfig) -> RunningServer {
    let mut orchestrator = ServerOrchestrator::build_from_config(config).await.unwrap();
    let port = orchestrator.local_addr().port();
    let storage = orchestrator.storage();
    let (stop, stopped) = oneshot::channel::<()>();
    let orchestrator = tokio::spawn(async move {
        orchestrator
            .run_until(async {
                let _ = stopped.await;
            })
            .await
    });
    RunningServer {
        orchestrator,
        stop,
        port,
        storage,
    }
}

fn identity() -> AgentInstance {
    AgentInstance {
        id: Uuid::parse_str(AGENT).unwrap(),
        instance_name: "srv-1c-01".to_owned(),
        utc_offset: 0.0,
    }
}

fn connect(port: u16, cancel: &CancellationToken) -> (Connection, JoinHandle<()>) {
    let config = ConnectionConfig {
        queue_capacity: 64,
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(100),
    };
    Connection::connect("127.0.0.1", port, identity(), config, cancel.clone())
}

fn write_log(root: &Path) -> PathBuf {
    let folder = root.join("rphost_1234");
    std::fs::create_dir_all(&folder).unwrap();
    let path = folder.join("23011512.log");
    std::fs::write(&path, BODY).unwrap();
    path
}

fn file_key() -> FileKey {
    FileKey {
        seance_id: Uuid::parse_str(SEANCE).unwrap(),
        template_id: Uuid::parse_str(TEMPLATE).unwrap(),
        folder: "rphost_1234".to_owned(),
        file: "23011512".to_owned(),
    }
}

async fn read_all(path: &Path) -> Vec<TechLogEventContent> {
    let key = file_key();
    let mut reader = EventReader::open(path, 0).await.unwrap();
    let mut contents = Vec::new();
    while reader.move_next().await.unwrap() {
        contents.push(TechLogEventContent {
            seance_id: key.seance_id,
            template_id: key.template_id,
            folder: reader.folder().to_owned(),
            file: reader.file().to_owned(),
            content: reader.event_content().to_owned(),
            end_position: reader.position() as i64,
        });
    }
    contents
}

async fn last_position(connection: &Connection) -> i64 {
    let reply = timeout(
        Duration::from_secs(5),
        connection.send_and_await(
            MessageType::LastFilePositionRequest,
            &LastFilePositionRequest::from(&file_key()),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.message_type(), MessageType::LastFilePosition);
    reply.decode::<i64>().unwrap()
}

fn catalog_text(finish_time: &str) -> String {
    format!(
        r#"
[[seances]]
id = "{SEANCE}"
start_time = "2023-01-15T10:00:00Z"
finish_time = "{finish_time}"
agents = ["{AGENT}"]

[[seances.templates]]
id = "{TEMPLATE}"
content = '<log location="{{LOG_PATH}}" history="24"/>'
"#
    )
}

#[tokio::test]
async fn shipped_events_are_stored_and_positions_answered() {
    let server = start_server(server_config(None)).await;
    let dir = tempfile::tempdir().unwrap();
    let contents = read_all(&write_log(dir.path())).await;
    assert_eq!(contents.len(), 2);

    let cancel = CancellationToken::new();
    let (connection, transport) = connect(server.port, &cancel);
    timeout(Duration::from_secs(5), connection.wait_connected())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(last_position(&connection).await, 0);

    for content in &contents {
        connection
            .push(MessageType::TechLogEventContent, content)
            .await
            .unwrap();
    }

    let events = server.wait_for_events(2).await;
    let agent_id = Uuid::parse_str(AGENT).unwrap();
    assert!(events.iter().all(|e| e.agent_id == agent_id));
    assert!(events.iter().all(|e| e.seance_id == file_key().seance_id));
    let mut names: Vec<&str> = events.iter().map(|e| e.event_name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["CONN", "EXCP"]);

    let end = BODY.len() as i64;
    assert_eq!(events.iter().map(|e| e.end_position).max(), Some(end));
    assert_eq!(last_position(&connection).await, end);

    cancel.cancel();
    let _ = transport.await;
    server.shutdown().await;
}

#[tokio::test]
async fn subscribed_agent_receives_catalog_seances() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("seances.toml");
    std::fs::write(&catalog, catalog_text("2023-01-15T12:00:00Z")).unwrap();
    let server = start_server(server_config(Some(&catalog))).await;

    let cancel = CancellationToken::new();
    let (connection, transport) = connect(server.port, &cancel);
    timeout(Duration::from_secs(5), connection.wait_connected())
        .await
        .unwrap()
        .unwrap();
    connection.subscribe_for_commands().await.unwrap();

    let push = timeout(Duration::from_secs(5), connection.read_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(push.message_type(), MessageType::TechLogSeances);
    let seances: Vec<TechLogSeance> = push.decode().unwrap();
    assert_eq!(seances.len(), 1);
    assert_eq!(seances[0].id, Uuid::parse_str(SEANCE).unwrap());
    assert!(seances[0].template.contains(&format!("{{LOG_PATH}}{TEMPLATE}")));

    let reply = timeout(
        Duration::from_secs(5),
        connection.request(MessageType::TechLogSeancesRequest),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.decode::<Vec<TechLogSeance>>().unwrap(), seances);

    // Catalog edits reach subscribed agents without a request.
    sleep(Duration::from_millis(1100)).await;
    std::fs::write(&catalog, catalog_text("2023-01-15T14:00:00Z")).unwrap();
    let push = timeout(Duration::from_secs(10), connection.read_message())
        .await
        .unwrap()
        .unwrap();
    let seances: Vec<TechLogSeance> = push.decode().unwrap();
    assert_eq!(seances[0].finish_time.to_rfc3339(), "2023-01-15T14:00:00+00:00");

    cancel.cancel();
    let _ = transport.await;
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_agents_get_no_seances() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("seances.toml");
    std::fs::write(&catalog, catalog_text("2023-01-15T12:00:00Z")).unwrap();
    let server = start_server(server_config(Some(&catalog))).await;

    let cancel = CancellationToken::new();
    let stranger = AgentInstance {
        id: Uuid::new_v4(),
        ..identity()
    };
    let (connection, transport) = Connection::connect(
        "127.0.0.1",
        server.port,
        stranger,
        ConnectionConfig::default(),
        cancel.clone(),
    );
    let reply = timeout(
        Duration::from_secs(5),
        connection.request(MessageType::TechLogSeancesRequest),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(reply.decode::<Vec<TechLogSeance>>().unwrap().is_empty());

    cancel.cancel();
    let _ = transport.await;
    server.shutdown().await;
}
