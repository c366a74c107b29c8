//! 에이전트와 서버가 공유하는 지속 프레임 연결
//!
//! 하나의 [`Connection`] 타입이 [`Role`]로 구분됩니다.
//!
//! - [`Role::Initiator`] (에이전트): 감독 태스크가 서버 호스트를 해석하고 제한 시간 안에
//!   접속한 뒤 첫 프레임으로 `AgentInfo`를 보냅니다. 요청 시 명령 구독을 다시 보내며,
//!   루트 취소 토큰이 발동할 때까지 끊길 때마다 재접속합니다.
//! - [`Role::Acceptor`] (서버): 수락한 소켓 하나를 감싸 단일 세션을 실행합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> ...
//!                                   |
//!                        cancel     v
//!                               Closed (종료)
//! ```
//!
//! # 수신 프레임 라우팅
//!
//! | callId | 대기 항목 | initiator       | acceptor   |
//! |--------|-----------|-----------------|------------|
//! | 0      | -         | 수신 큐         | 수신 큐    |
//! | 0 아님 | 있음      | 호출 완료       | 호출 완료  |
//! | 0 아님 | 없음      | 폐기 (지난 응답) | 수신 큐    |
//!
//! 송신 메시지는 용량이 제한된 큐에 쌓이며, 큐가 가득 차면 [`Connection::send`]가 대기합니다.
//! 큐의 메시지는 재접속 후에도 유지되고, 쓰기에 실패한 메시지는 재시도 슬롯에 보관되어
//! 다음 세션에서 가장 먼저 기록됩니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use onecmon_core::types::AgentInstance;

use crate::error::TransportError;
use crate::header::MessageType;
use crate::message::{Message, read_frame, write_frame};

/// 연결의 어느 쪽인지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 먼저 접속하고 자신을 알린 뒤 재접속을 담당
    Initiator,
    /// 수락한 소켓을 감싸는 단일 세션
    Acceptor,
}

/// 관찰 가능한 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// 전송 계층 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 송신/수신 큐 용량
    pub queue_capacity: usize,
    /// TCP 접속 1회 시도의 제한 시간
    pub connect_timeout: Duration,
    /// 재접속 시도 사이 대기 시간
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// 송신 큐 수신단과 마지막으로 쓰기에 실패한 메시지
struct Outbound {
    rx: mpsc::Receiver<Message>,
    retry: Option<Message>,
}

impl Outbound {
    async fn next(&mut self) -> Option<Message> {
        match self.retry.take() {
            Some(msg) => Some(msg),
            None => self.rx.recv().await,
        }
    }
}

struct Shared {
    role: Role,
    outbound_tx: mpsc::Sender<Message>,
    outbound: Mutex<Outbound>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    pending: DashMap<Uuid, oneshot::Sender<Message>>,
    state_tx: watch::Sender<ConnectionState>,
    subscribed: AtomicBool,
    sessions: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn new(role: Role, capacity: usize, shutdown: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role,
            outbound_tx,
            outbound: Mutex::new(Outbound {
                rx: outbound_rx,
                retry: None,
            }),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            pending: DashMap::new(),
            state_tx,
            subscribed: AtomicBool::new(false),
            sessions: AtomicU64::new(0),
            shutdown,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

/// 세션별 연결 끊김 래치. 첫 실패만 반영되고 이후 실패는 무시됩니다.
struct SessionGuard {
    closed: AtomicBool,
    token: CancellationToken,
}

impl SessionGuard {
    fn new(parent: &CancellationToken) -> Self {
        Self {
            closed: AtomicBool::new(false),
            token: parent.child_token(),
        }
    }

    /// 실제로 세션을 내린 호출에서만 true를 반환합니다.
    fn disconnect(&self, shared: &Shared, reason: &TransportError) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if !shared.shutdown.is_cancelled() {
            warn!(role = ?shared.role, error = %reason, "connection lost");
            shared.set_state(ConnectionState::Disconnected);
        }
        self.token.cancel();
        true
    }
}

/// 대기 중인 future가 먼저 drop되면 대기 호출 항목을 제거합니다.
struct PendingCall<'a> {
    pending: &'a DashMap<Uuid, oneshot::Sender<Message>>,
    call_id: Uuid,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.call_id);
    }
}

/// 프레임 연결 핸들 (복제 비용이 작음)
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// `host:port`로 initiator 연결을 시작합니다.
    ///
    /// 즉시 반환하며, 감독 태스크가 `cancel`이 발동할 때까지 백그라운드에서 (재)접속합니다.
    /// 첫 접속 전에 보낸 메시지는 큐에 쌓입니다.
    pub fn connect(
        host: impl Into<String>,
        port: u16,
        identity: AgentInstance,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared::new(
            Role::Initiator,
            config.queue_capacity,
            cancel.child_token(),
        ));
        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            host: host.into(),
            port,
            identity,
            config,
        };
        let handle = tokio::spawn(supervisor.run());
        (Self { shared }, handle)
    }

    /// 수락한 소켓을 감싸고 단일 세션을 시작합니다.
    ///
    /// 세션이 끝나면 [`ConnectionState::Closed`]가 되며, 수신 큐가 비워진 뒤
    /// [`read_message`](Self::read_message)는 `Closed`를 반환합니다.
    pub fn accept(
        stream: TcpStream,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared::new(Role::Acceptor, capacity, cancel.child_token()));
        shared.set_state(ConnectionState::Connected);
        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            let reason = run_session(&task_shared, stream).await;
            debug!(reason = %reason, "acceptor session finished");
            task_shared.pending.clear();
            task_shared.set_state(ConnectionState::Closed);
            task_shared.shutdown.cancel();
        });
        (Self { shared }, handle)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// 상태 변화를 구독합니다.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// 지금까지 수립된 세션 수
    pub fn session_count(&self) -> u64 {
        self.shared.sessions.load(Ordering::Relaxed)
    }

    /// 응답을 기다리는 호출 수
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// `Connected`가 될 때까지 대기하며, 닫히면 실패합니다.
    pub async fn wait_connected(&self) -> Result<(), TransportError> {
        let mut rx = self.watch_state();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(TransportError::Closed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    /// 메시지를 송신 큐에 넣습니다. 큐가 가득 차 있으면 대기합니다.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        tokio::select! {
            result = self.shared.outbound_tx.send(message) => {
                result.map_err(|_| TransportError::Closed)
            }
            _ = self.shared.shutdown.cancelled() => Err(TransportError::Closed),
        }
    }

    /// `value`를 인코딩해 요청 없는 메시지(callId 0)로 큐에 넣습니다.
    pub async fn push<T: Serialize + ?Sized>(
        &self,
        message_type: MessageType,
        value: &T,
    ) -> Result<(), TransportError> {
        self.send(Message::unsolicited(message_type, value)?).await
    }

    /// 같은 callId로 `request`에 응답합니다.
    pub async fn reply<T: Serialize + ?Sized>(
        &self,
        request: &Message,
        message_type: MessageType,
        value: &T,
    ) -> Result<(), TransportError> {
        self.send(request.reply(message_type, value)?).await
    }

    /// 새 callId로 요청을 보내고 짝이 맞는 응답을 기다립니다.
    ///
    /// 내부 타임아웃은 없으며 대기 시간은 호출자가 제한합니다. 세션이 먼저 끊기면
    /// [`TransportError::Disconnected`]를 반환하고, 재요청은 호출자 몫입니다.
    pub async fn send_and_await<T: Serialize + ?Sized>(
        &self,
        message_type: MessageType,
        value: &T,
    ) -> Result<Message, TransportError> {
        let call_id = Uuid::new_v4();
        let message = Message::encode(message_type, call_id, value)?;
        self.call(message).await
    }

    /// 본문 없는 요청용 [`send_and_await`](Self::send_and_await)
    pub async fn request(&self, message_type: MessageType) -> Result<Message, TransportError> {
        self.call(Message::empty(message_type, Uuid::new_v4())).await
    }

    async fn call(&self, message: Message) -> Result<Message, TransportError> {
        let call_id = message.call_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(call_id, tx);
        let _entry = PendingCall {
            pending: &self.shared.pending,
            call_id,
        };

        self.send(message).await?;

        tokio::select! {
            response = rx => response.map_err(|_| TransportError::Disconnected),
            _ = self.shared.shutdown.cancelled() => Err(TransportError::Closed),
        }
    }

    /// 수신 큐에서 다음 메시지를 읽습니다.
    ///
    /// 이미 큐에 있는 메시지는 `Closed`보다 먼저 반환됩니다.
    pub async fn read_message(&self) -> Result<Message, TransportError> {
        let mut rx = self.shared.inbound_rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => msg.ok_or(TransportError::Closed),
            _ = self.shared.shutdown.cancelled() => Err(TransportError::Closed),
        }
    }

    /// 이 연결을 명령 구독 상태로 표시합니다.
    ///
    /// initiator는 재접속할 때마다 구독을 다시 보냅니다. 접속 중에 호출하면 즉시 전송하며,
    /// 서버는 중복 구독을 무시합니다.
    pub async fn subscribe_for_commands(&self) -> Result<(), TransportError> {
        let already = self.shared.subscribed.swap(true, Ordering::SeqCst);
        if !already && self.state() == ConnectionState::Connected {
            self.send(Message::empty(MessageType::SubscribeForCommands, Uuid::nil()))
                .await?;
        }
        Ok(())
    }

    /// 연결을 영구적으로 닫습니다.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    host: String,
    port: u16,
    identity: AgentInstance,
    config: ConnectionConfig,
}

impl Supervisor {
    async fn run(self) {
        let shutdown = self.shared.shutdown.clone();
        let mut attempt: u64 = 0;

        while !shutdown.is_cancelled() {
            self.shared.set_state(ConnectionState::Connecting);
            if attempt > 0 {
                metrics::counter!(onecmon_core::metrics::AGENT_RECONNECTS_TOTAL).increment(1);
            }
            attempt += 1;

            let connected = tokio::select! {
                result = self.open() => result,
                _ = shutdown.cancelled() => break,
            };

            match connected {
                Ok(stream) => {
                    let reason = run_session(&self.shared, stream).await;
                    debug!(error = %reason, "initiator session finished");
                }
                Err(e) => {
                    warn!(host = %self.host, port = self.port, error = %e, "connect failed");
                }
            }

            // 끊긴 세션을 기다리던 호출은 재시도하지 않음
            self.shared.pending.clear();
            if shutdown.is_cancelled() {
                break;
            }
            self.shared.set_state(ConnectionState::Disconnected);

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.shared.pending.clear();
        self.shared.set_state(ConnectionState::Closed);
        info!(host = %self.host, "connection closed");
    }

    /// 주소를 해석해 접속한 뒤 식별 핸드셰이크를 수행합니다.
    async fn open(&self) -> Result<TcpStream, TransportError> {
        let target = format!("{}:{}", self.host, self.port);
        let addr = tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| TransportError::Resolve {
                host: self.host.clone(),
            })?;

        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: target.clone(),
                timeout_secs: self.config.connect_timeout.as_secs(),
            })??;
        stream.set_nodelay(true)?;

        let hello = Message::unsolicited(MessageType::AgentInfo, &self.identity)?;
        write_frame(&mut stream, &hello).await?;
        self.shared.set_state(ConnectionState::Connected);

        if self.shared.subscribed.load(Ordering::SeqCst) {
            let subscribe = Message::empty(MessageType::SubscribeForCommands, Uuid::nil());
            write_frame(&mut stream, &subscribe).await?;
        }

        info!(addr = %addr, agent_id = %self.identity.id, "connected to server");
        Ok(stream)
    }
}

/// 소켓 하나의 읽기/쓰기 루프를 실행합니다. 한쪽이 실패하거나 종료 신호가 오면 끝납니다.
async fn run_session(shared: &Arc<Shared>, stream: TcpStream) -> TransportError {
    shared.sessions.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = stream.into_split();
    let guard = Arc::new(SessionGuard::new(&shared.shutdown));
    let (reason_tx, mut reason_rx) = mpsc::channel::<TransportError>(2);

    let reader = tokio::spawn(read_loop(
        Arc::clone(shared),
        read_half,
        Arc::clone(&guard),
        reason_tx.clone(),
    ));
    let writer = tokio::spawn(write_loop(
        Arc::clone(shared),
        write_half,
        Arc::clone(&guard),
        reason_tx,
    ));

    guard.token.cancelled().await;
    let _ = reader.await;
    let _ = writer.await;

    reason_rx.recv().await.unwrap_or(TransportError::Closed)
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    guard: Arc<SessionGuard>,
    reasons: mpsc::Sender<TransportError>,
) {
    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => result,
            _ = guard.token.cancelled() => return,
        };

        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                if guard.disconnect(&shared, &e) {
                    let _ = reasons.try_send(e);
                }
                return;
            }
        };

        let Some(message) = route(&shared, message) else {
            continue;
        };

        tokio::select! {
            result = shared.inbound_tx.send(message) => {
                if result.is_err() {
                    return;
                }
            }
            _ = guard.token.cancelled() => return,
        }
    }
}

/// 대기 호출을 완료하거나, 수신 큐로 보낼 메시지를 돌려줍니다.
fn route(shared: &Shared, message: Message) -> Option<Message> {
    let call_id = message.call_id();
    if call_id.is_nil() {
        return Some(message);
    }
    if let Some((_, tx)) = shared.pending.remove(&call_id) {
        let _ = tx.send(message);
        return None;
    }
    match shared.role {
        Role::Acceptor => Some(message),
        Role::Initiator => {
            debug!(
                call_id = %call_id,
                message_type = %message.message_type(),
                "discarding stale response"
            );
            None
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    guard: Arc<SessionGuard>,
    reasons: mpsc::Sender<TransportError>,
) {
    let mut outbound = shared.outbound.lock().await;
    loop {
        let next = tokio::select! {
            msg = outbound.next() => msg,
            _ = guard.token.cancelled() => return,
        };
        let Some(message) = next else {
            return;
        };

        let written = tokio::select! {
            result = write_frame(&mut writer, &message) => Some(result),
            _ = guard.token.cancelled() => None,
        };

        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                outbound.retry = Some(message);
                if guard.disconnect(&shared, &e) {
                    let _ = reasons.try_send(e);
                }
                return;
            }
            None => {
                outbound.retry = Some(message);
                return;
            }
        }
    }
}
