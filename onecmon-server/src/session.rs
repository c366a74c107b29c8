//! Per-connection message routing.
//!
//! Each accepted socket becomes an acceptor [`Connection`]. The first frame must be
//! `AgentInfo`; anything else is a protocol violation and closes the connection. After
//! identification messages are dispatched by type:
//!
//! | message                   | action                                        |
//! |---------------------------|-----------------------------------------------|
//! | `TechLogEventContent`     | submit to the ingestion pipeline              |
//! | `LastFilePositionRequest` | answer `LastFilePosition` from storage        |
//! | `TechLogSeancesRequest`   | answer `TechLogSeances` from the catalog      |
//! | `SubscribeForCommands`    | subscribe, then push `TechLogSeances` once    |
//! | anything else             | protocol violation                            |

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use onecmon_core::metrics as m;
use onecmon_core::types::{AgentInstance, LastFilePositionRequest, TechLogEventContent};
use onecmon_protocol::{Connection, Message, MessageType, TransportError};
use onecmon_techlog::{IngestHandle, TechLogStorage};

use crate::error::ServerError;
use crate::registry::ConnectionRegistry;

/// Time a new connection gets to identify itself.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state every session needs.
pub struct SessionContext<S: TechLogStorage> {
    pub registry: Arc<ConnectionRegistry>,
    pub ingest: IngestHandle,
    pub storage: Arc<S>,
    /// Inbound and outbound queue capacity per connection.
    pub queue_capacity: usize,
}

impl<S: TechLogStorage> Clone for SessionContext<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            ingest: self.ingest.clone(),
            storage: Arc::clone(&self.storage),
            queue_capacity: self.queue_capacity,
        }
    }
}

/// One identified agent connection.
pub struct AgentSession<S: TechLogStorage> {
    conn_id: Uuid,
    agent: Arc<AgentInstance>,
    connection: Connection,
    ctx: SessionContext<S>,
}

impl<S: TechLogStorage> AgentSession<S> {
    /// Serves `stream` until the peer disconnects, breaks the protocol, or `cancel` fires.
    pub async fn serve(
        stream: TcpStream,
        ctx: SessionContext<S>,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        let (connection, io_task) = Connection::accept(stream, ctx.queue_capacity, cancel);

        let result = match handshake(&connection).await {
            Ok(agent) => {
                info!(peer = %peer, agent_id = %agent.id, instance_name = %agent.instance_name, "agent connected");
                let session = Self {
                    conn_id: Uuid::new_v4(),
                    agent: Arc::new(agent),
                    connection: connection.clone(),
                    ctx,
                };
                session.ctx.registry.register(
                    session.conn_id,
                    Arc::clone(&session.agent),
                    session.connection.clone(),
                );
                let result = session.run().await;
                session.ctx.registry.unregister(session.conn_id);
                info!(peer = %peer, agent_id = %session.agent.id, "agent disconnected");
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if e.is_protocol_violation() {
                warn!(peer = %peer, error = %e, "closing connection after protocol violation");
            }
        }
        connection.close();
        let _ = io_task.await;
        result
    }

    async fn run(&self) -> Result<(), ServerError> {
        loop {
            let message = match self.connection.read_message().await {
                Ok(message) => message,
                Err(TransportError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match self.dispatch(message).await {
                Ok(()) => {}
                Err(e) if e.is_protocol_violation() => return Err(e),
                Err(e) => {
                    warn!(agent_id = %self.agent.id, error = %e, "failed to handle message");
                }
            }
        }
    }

    async fn dispatch(&self, message: Message) -> Result<(), ServerError> {
        match message.message_type() {
            MessageType::TechLogEventContent => {
                let content: TechLogEventContent = message.decode()?;
                self.ctx
                    .ingest
                    .submit(Arc::clone(&self.agent), content)
                    .await?;
            }
            MessageType::LastFilePositionRequest => {
                let request: LastFilePositionRequest = message.decode()?;
                let position = self
                    .ctx
                    .storage
                    .query_last_position(self.agent.id, &request.key())
                    .await?;
                debug!(agent_id = %self.agent.id, file = %request.key(), offset = position, "last file position");
                self.connection
                    .reply(&message, MessageType::LastFilePosition, &position)
                    .await?;
            }
            MessageType::TechLogSeancesRequest => {
                let seances = self.ctx.registry.catalog().seances_for(self.agent.id);
                self.connection
                    .reply(&message, MessageType::TechLogSeances, &seances)
                    .await?;
            }
            MessageType::SubscribeForCommands => {
                self.ctx.registry.subscribe(self.conn_id);
                self.ctx.registry.push_seances(self.agent.id).await?;
            }
            other => {
                return Err(violation("TechLogEventContent or a request", other));
            }
        }
        Ok(())
    }
}

/// Reads the identification frame.
async fn handshake(connection: &Connection) -> Result<AgentInstance, ServerError> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, connection.read_message())
        .await
        .map_err(|_| TransportError::Closed)??;
    if first.message_type() != MessageType::AgentInfo {
        return Err(violation(MessageType::AgentInfo.name(), first.message_type()));
    }
    Ok(first.decode()?)
}

fn violation(expected: &str, actual: MessageType) -> ServerError {
    metrics::counter!(
        m::SERVER_PROTOCOL_VIOLATIONS_TOTAL,
        m::LABEL_MESSAGE_TYPE => actual.name()
    )
    .increment(1);
    TransportError::ProtocolViolation {
        expected: expected.to_owned(),
        actual: actual.name().to_owned(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use onecmon_core::config::PipelineConfig;
    use onecmon_core::types::FileKey;
    use onecmon_protocol::{read_frame, write_frame};
    use onecmon_techlog::{IngestionPipelineBuilder, MemoryStorage};

    use super::*;
    use crate::catalog::SeanceCatalog;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn context() -> (SessionContext<MemoryStorage>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let (_pipeline, ingest) = IngestionPipelineBuilder::new(Arc::clone(&storage))
            .config(PipelineConfig::default())
            .build()
            .unwrap();
        let ctx = SessionContext {
            registry: Arc::new(ConnectionRegistry::new(Arc::new(SeanceCatalog::empty()))),
            ingest,
            storage: Arc::clone(&storage),
            queue_capacity: 16,
        };
        (ctx, storage)
    }

    fn agent() -> AgentInstance {
        AgentInstance {
            id: Uuid::new_v4(),
            instance_name: "srv-1c".to_owned(),
            utc_offset: 10800.0,
        }
    }

    #[tokio::test]
    async fn first_message_must_be_agent_info() {
        let (mut client, server) = socket_pair().await;
        let (ctx, _) = context();
        let session = tokio::spawn(AgentSession::serve(server, ctx, CancellationToken::new()));

        let wrong = Message::empty(MessageType::TechLogSeancesRequest, Uuid::new_v4());
        write_frame(&mut client, &wrong).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_protocol_violation());
    }

    #[tokio::test]
    async fn answers_position_and_seance_requests() {
        let (mut client, server) = socket_pair().await;
        let (ctx, _) = context();
        let registry = Arc::clone(&ctx.registry);
        let session = tokio::spawn(AgentSession::serve(server, ctx, CancellationToken::new()));

        let hello = Message::unsolicited(MessageType::AgentInfo, &agent()).unwrap();
        write_frame(&mut client, &hello).await.unwrap();

        let key = FileKey {
            seance_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            folder: "rphost_1".to_owned(),
            file: "23011512".to_owned(),
        };
        let call_id = Uuid::new_v4();
        let request = Message::encode(
            MessageType::LastFilePositionRequest,
            call_id,
            &LastFilePositionRequest::from(&key),
        )
        .unwrap();
        write_frame(&mut client, &request).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), MessageType::LastFilePosition);
        assert_eq!(reply.call_id(), call_id);
        assert_eq!(reply.decode::<i64>().unwrap(), 0);
        assert_eq!(registry.connected_agents(), 1);

        let call_id = Uuid::new_v4();
        let request = Message::empty(MessageType::TechLogSeancesRequest, call_id);
        write_frame(&mut client, &request).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.call_id(), call_id);
        assert!(reply.decode::<Vec<onecmon_core::types::TechLogSeance>>().unwrap().is_empty());

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(registry.connected_agents(), 0);
    }

    #[tokio::test]
    async fn subscribe_pushes_seances() {
        let (mut client, server) = socket_pair().await;
        let (ctx, _) = context();
        let registry = Arc::clone(&ctx.registry);
        let identity = agent();
        let session = tokio::spawn(AgentSession::serve(server, ctx, CancellationToken::new()));

        write_frame(
            &mut client,
            &Message::unsolicited(MessageType::AgentInfo, &identity).unwrap(),
        )
        .await
        .unwrap();
        write_frame(
            &mut client,
            &Message::empty(MessageType::SubscribeForCommands, Uuid::nil()),
        )
        .await
        .unwrap();

        let push = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut client))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(push.message_type(), MessageType::TechLogSeances);
        assert!(push.call_id().is_nil());
        assert!(registry.is_subscribed(identity.id));

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!registry.is_subscribed(identity.id));
    }

    #[tokio::test]
    async fn repeated_agent_info_is_a_violation() {
        let (mut client, server) = socket_pair().await;
        let (ctx, _) = context();
        let session = tokio::spawn(AgentSession::serve(server, ctx, CancellationToken::new()));

        let hello = Message::unsolicited(MessageType::AgentInfo, &agent()).unwrap();
        write_frame(&mut client, &hello).await.unwrap();
        write_frame(&mut client, &hello).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_protocol_violation());
    }
}
