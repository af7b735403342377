//! Per-connection protocol state machine.
//!
//! A [`ConnectionProtocol`] starts unauthenticated, becomes authenticated on a
//! valid `auth` message, and binds to at most one session at a time. It turns
//! client frames into registry calls and the bound session's output into
//! server messages. It knows nothing about sockets.

use std::sync::Arc;

use protocol::{
    timestamp_now, AuthRequest, AuthSuccess, ClientMessage, ErrorCode, ErrorPayload, Output, Pong,
    ProtocolError, ResizeRequest, ServerMessage, SessionClosed, SessionCreateRequest,
    SessionCreated, SessionExit, SignalRequest,
};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Identity, TokenVerifier};
use crate::session::{
    CreatedSession, SessionError, SessionEvent, SessionId, SessionRegistry, SessionSubscription,
};

/// Errors reported back to the client as a single message.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication required")]
    AuthRequired,

    #[error("no session is bound to this connection")]
    SessionRequired,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::AuthRequired => ErrorCode::AuthRequired,
            ConnectionError::SessionRequired => ErrorCode::SessionRequired,
            ConnectionError::Auth(_) => ErrorCode::AuthFailed,
            ConnectionError::Session(e) => match e {
                SessionError::NotFound(_) => ErrorCode::SessionNotFound,
                SessionError::Inactive(_) => ErrorCode::SessionInactive,
                SessionError::SpawnFailed(_) => ErrorCode::SpawnError,
                SessionError::LimitReached(_) => ErrorCode::SessionLimit,
                SessionError::InvalidSignal(_) => ErrorCode::InvalidSignal,
                SessionError::InvalidGeometry { .. } => ErrorCode::InvalidGeometry,
                SessionError::ResizeFailed(_)
                | SessionError::SignalFailed(_)
                | SessionError::Io(_) => ErrorCode::InternalError,
            },
            ConnectionError::Protocol(e) => e.code(),
        }
    }

    /// Converts the error into the message sent to the client.
    pub fn to_message(&self) -> ServerMessage {
        let payload = ErrorPayload::new(self.code(), self.to_string());
        match self {
            ConnectionError::Auth(_) => ServerMessage::AuthFailure(payload),
            _ => ServerMessage::Error(payload),
        }
    }
}

struct Binding {
    session_id: SessionId,
    subscription: SessionSubscription,
}

/// Protocol state for one client connection.
pub struct ConnectionProtocol<R: SessionRegistry, V: TokenVerifier> {
    connection_id: String,
    registry: Arc<R>,
    verifier: Arc<V>,
    identity: Option<Identity>,
    binding: Option<Binding>,
}

impl<R: SessionRegistry, V: TokenVerifier> ConnectionProtocol<R, V> {
    pub fn new(connection_id: impl Into<String>, registry: Arc<R>, verifier: Arc<V>) -> Self {
        Self {
            connection_id: connection_id.into(),
            registry,
            verifier,
            identity: None,
            binding: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// The session currently bound to this connection.
    pub fn bound_session(&self) -> Option<&SessionId> {
        self.binding.as_ref().map(|b| &b.session_id)
    }

    /// Handles one inbound text frame.
    ///
    /// Frames that fail to parse yield a single `error` and leave the state
    /// untouched.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "Rejected inbound frame");
                vec![ConnectionError::from(e).to_message()]
            }
        }
    }

    /// Handles one validated client message and returns the replies in order.
    pub async fn handle(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        debug!(connection_id = %self.connection_id, kind = message.kind(), "Handling message");

        let mut replies = Vec::new();
        let result = match message {
            ClientMessage::Auth(req) => {
                replies.push(self.handle_auth(req));
                Ok(())
            }
            ClientMessage::SessionCreate(req) => {
                self.handle_session_create(req, &mut replies).await
            }
            ClientMessage::SessionClose => {
                self.handle_session_close(&mut replies);
                Ok(())
            }
            ClientMessage::Command(data) => self.handle_command(&data),
            ClientMessage::Resize(req) => self.handle_resize(req),
            ClientMessage::Signal(req) => self.handle_signal(req),
            ClientMessage::Ping => {
                replies.push(ServerMessage::Pong(Pong {
                    timestamp: timestamp_now(),
                }));
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(connection_id = %self.connection_id, error = %e, "Message rejected");
            replies.push(e.to_message());
        }
        replies
    }

    /// Waits for the next event from the bound session.
    ///
    /// Pending while no session is bound. An exit event clears the binding.
    /// Cancel safe.
    pub async fn next_event(&mut self) -> ServerMessage {
        loop {
            let Some(binding) = self.binding.as_mut() else {
                return std::future::pending().await;
            };

            match binding.subscription.recv().await {
                Some(SessionEvent::Output(chunk)) => {
                    return ServerMessage::Output(Output {
                        session_id: binding.session_id.clone(),
                        bytes: chunk.to_vec(),
                    });
                }
                Some(SessionEvent::Exit(exit)) => {
                    let session_id = binding.session_id.clone();
                    self.binding = None;
                    info!(
                        connection_id = %self.connection_id,
                        session_id = %session_id,
                        exit_code = exit.exit_code,
                        "Bound session exited"
                    );
                    return ServerMessage::SessionExit(SessionExit {
                        session_id,
                        exit_code: exit.exit_code,
                        signal: exit.signal,
                    });
                }
                None => {
                    warn!(
                        connection_id = %self.connection_id,
                        session_id = %binding.session_id,
                        "Session stream ended without exit"
                    );
                    self.binding = None;
                }
            }
        }
    }

    /// Releases the bound session. Called when the transport goes away.
    pub fn shutdown(&mut self) {
        if let Some(session_id) = self.unbind_and_close() {
            info!(
                connection_id = %self.connection_id,
                session_id = %session_id,
                "Closed session of disconnected client"
            );
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    fn handle_auth(&mut self, req: AuthRequest) -> ServerMessage {
        if req.token.is_empty() {
            debug!(connection_id = %self.connection_id, "Auth without a token");
            return ServerMessage::AuthFailure(ErrorPayload::new(
                ErrorCode::AuthFailed,
                "Token required",
            ));
        }

        let identity = match self.verifier.verify_token(&req.token) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Authentication failed");
                return ConnectionError::Auth(e).to_message();
            }
        };

        if let Some(current) = &self.identity {
            if current.id != identity.id {
                warn!(
                    connection_id = %self.connection_id,
                    current = %current.username,
                    requested = %identity.username,
                    "Rejected re-authentication as a different user"
                );
                return ServerMessage::AuthFailure(ErrorPayload::new(
                    ErrorCode::AuthFailed,
                    "connection is already authenticated as another user",
                ));
            }
        }

        info!(
            connection_id = %self.connection_id,
            user = %identity.username,
            "Connection authenticated"
        );
        let user = (&identity).into();
        self.identity = Some(identity);
        ServerMessage::AuthSuccess(AuthSuccess { user })
    }

    async fn handle_session_create(
        &mut self,
        req: SessionCreateRequest,
        replies: &mut Vec<ServerMessage>,
    ) -> Result<(), ConnectionError> {
        let owner_id = self
            .identity
            .as_ref()
            .map(|i| i.id.clone())
            .ok_or(ConnectionError::AuthRequired)?;

        if let Some(previous) = self.unbind_and_close() {
            debug!(
                connection_id = %self.connection_id,
                session_id = %previous,
                "Replacing bound session"
            );
            replies.push(ServerMessage::SessionClosed(SessionClosed {
                session_id: previous,
            }));
        }

        let CreatedSession {
            summary,
            subscription,
        } = self.registry.create(&owner_id, req.into()).await?;
        let session_id = summary.id;

        info!(
            connection_id = %self.connection_id,
            session_id = %session_id,
            shell = %summary.shell,
            "Session bound to connection"
        );

        self.binding = Some(Binding {
            session_id: session_id.clone(),
            subscription,
        });
        replies.push(ServerMessage::SessionCreated(SessionCreated {
            session_id,
            shell: summary.shell,
            cols: summary.cols,
            rows: summary.rows,
        }));
        Ok(())
    }

    fn handle_session_close(&mut self, replies: &mut Vec<ServerMessage>) {
        if !self.is_authenticated() {
            return;
        }
        if let Some(session_id) = self.unbind_and_close() {
            info!(
                connection_id = %self.connection_id,
                session_id = %session_id,
                "Session closed by client"
            );
            replies.push(ServerMessage::SessionClosed(SessionClosed { session_id }));
        }
    }

    fn handle_command(&mut self, data: &str) -> Result<(), ConnectionError> {
        let session_id = self.require_bound()?;
        self.registry.write(session_id, data.as_bytes())?;
        Ok(())
    }

    fn handle_resize(&mut self, req: ResizeRequest) -> Result<(), ConnectionError> {
        let session_id = self.require_bound()?;
        self.registry.resize(session_id, req.cols, req.rows)?;
        Ok(())
    }

    fn handle_signal(&mut self, req: SignalRequest) -> Result<(), ConnectionError> {
        let session_id = self.require_bound()?;
        self.registry.signal(session_id, &req.signal)?;
        Ok(())
    }

    fn require_bound(&self) -> Result<&SessionId, ConnectionError> {
        self.binding
            .as_ref()
            .map(|b| &b.session_id)
            .ok_or(ConnectionError::SessionRequired)
    }

    /// Cancels the subscription and closes the bound session, if any.
    fn unbind_and_close(&mut self) -> Option<SessionId> {
        let Binding {
            session_id,
            subscription,
        } = self.binding.take()?;
        subscription.cancel();
        self.registry.close(&session_id);
        Some(session_id)
    }
}

impl<R: SessionRegistry, V: TokenVerifier> Drop for ConnectionProtocol<R, V> {
    fn drop(&mut self) {
        self.unbind_and_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ExitInfo, OutputHub, SessionOptions, SessionSummary};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FakeSession {
        owner_id: String,
        hub: Arc<OutputHub>,
        input: Vec<u8>,
        size: (u16, u16),
        signals: Vec<String>,
    }

    /// In-memory registry backed by real output hubs.
    #[derive(Default)]
    struct FakeRegistry {
        sessions: Mutex<HashMap<SessionId, FakeSession>>,
        closed: Mutex<Vec<SessionId>>,
        next_id: Mutex<u32>,
        fail_spawn: bool,
        /// Shells exit with this code, and are cleaned up, before `create` returns.
        exit_on_spawn: Option<i32>,
    }

    impl FakeRegistry {
        fn failing() -> Self {
            Self {
                fail_spawn: true,
                ..Self::default()
            }
        }

        fn exiting(exit_code: i32) -> Self {
            Self {
                exit_on_spawn: Some(exit_code),
                ..Self::default()
            }
        }

        fn hub(&self, id: &SessionId) -> Arc<OutputHub> {
            Arc::clone(&self.sessions.lock()[id].hub)
        }

        fn input(&self, id: &SessionId) -> Vec<u8> {
            self.sessions.lock()[id].input.clone()
        }

        fn closed(&self) -> Vec<SessionId> {
            self.closed.lock().clone()
        }
    }

    impl SessionRegistry for FakeRegistry {
        async fn create(
            &self,
            owner_id: &String,
            requested: SessionOptions,
        ) -> Result<CreatedSession, SessionError> {
            if self.fail_spawn {
                return Err(SessionError::SpawnFailed("no such shell".to_string()));
            }
            let mut next = self.next_id.lock();
            *next += 1;
            let id = format!("session-{}", *next);
            let hub = OutputHub::new(id.clone());
            let subscription = hub.subscribe();
            let size = (requested.cols.unwrap_or(80), requested.rows.unwrap_or(24));

            if let Some(exit_code) = self.exit_on_spawn {
                hub.finish(ExitInfo {
                    exit_code,
                    signal: None,
                });
            } else {
                self.sessions.lock().insert(
                    id.clone(),
                    FakeSession {
                        owner_id: owner_id.clone(),
                        hub: Arc::clone(&hub),
                        input: Vec::new(),
                        size,
                        signals: Vec::new(),
                    },
                );
            }

            Ok(CreatedSession {
                summary: fake_summary(&id, owner_id, size, hub.exit_info().is_none()),
                subscription,
            })
        }

        fn subscribe(&self, session_id: &SessionId) -> Result<SessionSubscription, SessionError> {
            let sessions = self.sessions.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
            Ok(session.hub.subscribe())
        }

        fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
            if session.hub.exit_info().is_some() {
                return Err(SessionError::Inactive(session_id.clone()));
            }
            session.input.extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
            if cols == 0 || rows == 0 {
                return Err(SessionError::InvalidGeometry { cols, rows });
            }
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
            session.size = (cols, rows);
            Ok(())
        }

        fn signal(&self, session_id: &SessionId, signal: &str) -> Result<(), SessionError> {
            if !signal.starts_with("SIG") {
                return Err(SessionError::InvalidSignal(signal.to_string()));
            }
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
            session.signals.push(signal.to_string());
            Ok(())
        }

        fn close(&self, session_id: &SessionId) -> bool {
            let removed = self.sessions.lock().remove(session_id);
            if let Some(session) = &removed {
                session.hub.finish(ExitInfo {
                    exit_code: 0,
                    signal: Some("SIGTERM".to_string()),
                });
                self.closed.lock().push(session_id.clone());
            }
            removed.is_some()
        }

        fn cleanup(&self, session_id: &SessionId) -> bool {
            self.sessions.lock().remove(session_id).is_some()
        }

        fn get(&self, session_id: &SessionId) -> Option<SessionSummary> {
            let sessions = self.sessions.lock();
            let session = sessions.get(session_id)?;
            Some(fake_summary(
                session_id,
                &session.owner_id,
                session.size,
                session.hub.exit_info().is_none(),
            ))
        }

        fn list_for_owner(&self, owner_id: &String) -> Vec<SessionSummary> {
            let ids: Vec<SessionId> = self
                .sessions
                .lock()
                .iter()
                .filter(|(_, s)| &s.owner_id == owner_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| self.get(id)).collect()
        }

        fn active_count(&self) -> usize {
            self.sessions.lock().len()
        }

        async fn close_all(&self) {
            let ids: Vec<SessionId> = self.sessions.lock().keys().cloned().collect();
            for id in ids {
                self.close(&id);
            }
        }
    }

    fn fake_summary(
        id: &SessionId,
        owner_id: &String,
        (cols, rows): (u16, u16),
        is_active: bool,
    ) -> SessionSummary {
        SessionSummary {
            id: id.clone(),
            owner_id: owner_id.clone(),
            shell: "/bin/fake".to_string(),
            cwd: "/".to_string(),
            cols,
            rows,
            created_at: 0,
            last_activity_at: 0,
            is_active,
        }
    }

    /// Accepts `token-<username>`.
    struct FakeVerifier;

    impl TokenVerifier for FakeVerifier {
        fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
            let username = token
                .strip_prefix("token-")
                .ok_or(AuthError::InvalidToken)?;
            Ok(Identity {
                id: format!("id-{username}"),
                username: username.to_string(),
                role: "user".to_string(),
            })
        }
    }

    type TestConnection = ConnectionProtocol<FakeRegistry, FakeVerifier>;

    fn connection() -> (Arc<FakeRegistry>, TestConnection) {
        let registry = Arc::new(FakeRegistry::default());
        let conn = ConnectionProtocol::new("conn-1", Arc::clone(&registry), Arc::new(FakeVerifier));
        (registry, conn)
    }

    fn auth(token: &str) -> ClientMessage {
        ClientMessage::Auth(AuthRequest {
            token: token.to_string(),
        })
    }

    fn create() -> ClientMessage {
        ClientMessage::SessionCreate(SessionCreateRequest::default())
    }

    fn error_code(reply: &ServerMessage) -> ErrorCode {
        match reply {
            ServerMessage::Error(e) | ServerMessage::AuthFailure(e) => e.code,
            other => panic!("expected an error, got {other:?}"),
        }
    }

    async fn authed_and_bound() -> (Arc<FakeRegistry>, TestConnection, SessionId) {
        let (registry, mut conn) = connection();
        conn.handle(auth("token-alice")).await;
        let replies = conn.handle(create()).await;
        let ServerMessage::SessionCreated(created) = &replies[0] else {
            panic!("expected session:created, got {replies:?}");
        };
        let id = created.session_id.clone();
        (registry, conn, id)
    }

    #[tokio::test]
    async fn test_auth_success() {
        let (_, mut conn) = connection();
        let replies = conn.handle(auth("token-alice")).await;

        assert_eq!(replies.len(), 1);
        let ServerMessage::AuthSuccess(success) = &replies[0] else {
            panic!("expected auth:success");
        };
        assert_eq!(success.user.username, "alice");
        assert_eq!(success.user.id, "id-alice");
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_unauthenticated() {
        let (_, mut conn) = connection();
        let replies = conn.handle(auth("garbage")).await;

        assert!(matches!(replies[0], ServerMessage::AuthFailure(_)));
        assert_eq!(error_code(&replies[0]), ErrorCode::AuthFailed);
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_reauth_as_same_user_succeeds() {
        let (_, mut conn) = connection();
        conn.handle(auth("token-alice")).await;
        let replies = conn.handle(auth("token-alice")).await;
        assert!(matches!(replies[0], ServerMessage::AuthSuccess(_)));
    }

    #[tokio::test]
    async fn test_reauth_as_other_user_rejected() {
        let (_, mut conn) = connection();
        conn.handle(auth("token-alice")).await;
        let replies = conn.handle(auth("token-bob")).await;

        assert_eq!(error_code(&replies[0]), ErrorCode::AuthFailed);
        assert_eq!(conn.identity().unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_create_requires_auth() {
        let (registry, mut conn) = connection();
        let replies = conn.handle(create()).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(error_code(&replies[0]), ErrorCode::AuthRequired);
        assert_eq!(registry.active_count(), 0);
        assert!(conn.bound_session().is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_commands_have_no_side_effects() {
        let (registry, mut conn) = connection();

        for message in [
            ClientMessage::Command("ls\n".to_string()),
            ClientMessage::Resize(ResizeRequest { cols: 100, rows: 30 }),
            ClientMessage::Signal(SignalRequest {
                signal: "SIGINT".to_string(),
            }),
        ] {
            let replies = conn.handle(message).await;
            assert_eq!(error_code(&replies[0]), ErrorCode::SessionRequired);
        }

        assert!(conn.handle(ClientMessage::SessionClose).await.is_empty());
        assert_eq!(registry.active_count(), 0);
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_create_binds_session() {
        let (registry, conn, id) = authed_and_bound().await;
        assert_eq!(conn.bound_session(), Some(&id));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(
            registry.list_for_owner(&"id-alice".to_string())[0].id,
            id
        );
    }

    #[tokio::test]
    async fn test_create_reports_geometry() {
        let (_, mut conn) = connection();
        conn.handle(auth("token-alice")).await;
        let replies = conn
            .handle(ClientMessage::SessionCreate(SessionCreateRequest {
                cols: Some(132),
                rows: Some(43),
                ..Default::default()
            }))
            .await;

        let ServerMessage::SessionCreated(created) = &replies[0] else {
            panic!("expected session:created");
        };
        assert_eq!((created.cols, created.rows), (132, 43));
        assert_eq!(created.shell, "/bin/fake");
    }

    #[tokio::test]
    async fn test_create_again_replaces_bound_session() {
        let (registry, mut conn, first) = authed_and_bound().await;
        let replies = conn.handle(create()).await;

        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[0],
            ServerMessage::SessionClosed(SessionClosed {
                session_id: first.clone()
            })
        );
        let ServerMessage::SessionCreated(created) = &replies[1] else {
            panic!("expected session:created");
        };
        assert_ne!(created.session_id, first);
        assert_eq!(registry.closed(), vec![first]);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_spawn_error() {
        let registry = Arc::new(FakeRegistry::failing());
        let mut conn = ConnectionProtocol::new("conn-1", Arc::clone(&registry), Arc::new(FakeVerifier));
        conn.handle(auth("token-alice")).await;

        let replies = conn.handle(create()).await;
        assert_eq!(error_code(&replies[0]), ErrorCode::SpawnError);
        assert!(conn.bound_session().is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_create_of_immediately_exiting_shell() {
        let registry = Arc::new(FakeRegistry::exiting(127));
        let mut conn = ConnectionProtocol::new("conn-1", Arc::clone(&registry), Arc::new(FakeVerifier));
        conn.handle(auth("token-alice")).await;

        let replies = conn
            .handle(ClientMessage::SessionCreate(SessionCreateRequest {
                cols: Some(100),
                ..Default::default()
            }))
            .await;
        assert_eq!(replies.len(), 1, "got {replies:?}");
        let ServerMessage::SessionCreated(created) = &replies[0] else {
            panic!("expected session:created, got {replies:?}");
        };
        assert_eq!((created.cols, created.rows), (100, 24));
        assert_eq!(registry.active_count(), 0);

        let event = timeout(Duration::from_secs(1), conn.next_event()).await.unwrap();
        assert_eq!(
            event,
            ServerMessage::SessionExit(SessionExit {
                session_id: created.session_id.clone(),
                exit_code: 127,
                signal: None
            })
        );
        assert!(conn.bound_session().is_none());
    }

    #[tokio::test]
    async fn test_command_writes_raw_bytes() {
        let (registry, mut conn, id) = authed_and_bound().await;

        let replies = conn
            .handle(ClientMessage::Command("echo hi\n".to_string()))
            .await;
        assert!(replies.is_empty());
        conn.handle(ClientMessage::Command("\u{3}".to_string())).await;

        assert_eq!(registry.input(&id), b"echo hi\n\x03".to_vec());
    }

    #[tokio::test]
    async fn test_resize_and_signal_errors_are_reported() {
        let (_, mut conn, _) = authed_and_bound().await;

        let replies = conn
            .handle(ClientMessage::Resize(ResizeRequest { cols: 0, rows: 10 }))
            .await;
        assert_eq!(error_code(&replies[0]), ErrorCode::InvalidGeometry);

        let replies = conn
            .handle(ClientMessage::Signal(SignalRequest {
                signal: "NOPE".to_string(),
            }))
            .await;
        assert_eq!(error_code(&replies[0]), ErrorCode::InvalidSignal);

        assert!(conn.bound_session().is_some());
    }

    #[tokio::test]
    async fn test_session_close_unbinds() {
        let (registry, mut conn, id) = authed_and_bound().await;

        let replies = conn.handle(ClientMessage::SessionClose).await;
        assert_eq!(
            replies,
            vec![ServerMessage::SessionClosed(SessionClosed {
                session_id: id.clone()
            })]
        );
        assert!(conn.bound_session().is_none());
        assert_eq!(registry.closed(), vec![id]);

        assert!(conn.handle(ClientMessage::SessionClose).await.is_empty());
        let replies = conn.handle(ClientMessage::Command("x".to_string())).await;
        assert_eq!(error_code(&replies[0]), ErrorCode::SessionRequired);
    }

    #[tokio::test]
    async fn test_ping_works_unauthenticated() {
        let (_, mut conn) = connection();
        let replies = conn.handle(ClientMessage::Ping).await;
        assert!(matches!(replies[0], ServerMessage::Pong(Pong { timestamp }) if timestamp > 0));
    }

    #[tokio::test]
    async fn test_handle_text_rejects_bad_frames() {
        let (_, mut conn) = connection();

        let replies = conn.handle_text("not json").await;
        assert_eq!(error_code(&replies[0]), ErrorCode::InvalidMessage);

        let replies = conn.handle_text(r#"{"type":"launch","data":{}}"#).await;
        assert_eq!(error_code(&replies[0]), ErrorCode::InvalidMessageType);

        let replies = conn.handle_text(r#"{"type":"auth","data":{"token":7}}"#).await;
        assert_eq!(error_code(&replies[0]), ErrorCode::InvalidMessage);

        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_without_token_is_refused() {
        let (_, mut conn) = connection();

        for text in [
            r#"{"type":"auth","data":{}}"#,
            r#"{"type":"auth"}"#,
            r#"{"type":"auth","data":{"token":""}}"#,
        ] {
            let replies = conn.handle_text(text).await;
            assert_eq!(replies.len(), 1, "input: {text}");
            let ServerMessage::AuthFailure(failure) = &replies[0] else {
                panic!("expected auth:failure for {text}, got {replies:?}");
            };
            assert_eq!(failure.code, ErrorCode::AuthFailed);
            assert_eq!(failure.message, "Token required");
        }
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_command_payload_shapes_reach_the_session() {
        let (registry, mut conn, id) = authed_and_bound().await;

        for text in [
            r#"{"type":"command","data":"a"}"#,
            r#"{"type":"command","data":{"command":"b","encoding":"utf8"}}"#,
            r#"{"type":"command","data":{"command":"c"}}"#,
            r#"{"type":"command","data":{"data":"d"}}"#,
        ] {
            assert!(conn.handle_text(text).await.is_empty(), "input: {text}");
        }

        assert_eq!(registry.input(&id), b"abcd".to_vec());
    }

    #[tokio::test]
    async fn test_handle_text_auth() {
        let (_, mut conn) = connection();
        let replies = conn
            .handle_text(r#"{"type":"auth","data":{"token":"token-carol"},"timestamp":1}"#)
            .await;
        assert!(matches!(replies[0], ServerMessage::AuthSuccess(_)));
    }

    #[tokio::test]
    async fn test_output_then_exit_clears_binding() {
        let (registry, mut conn, id) = authed_and_bound().await;
        let hub = registry.hub(&id);

        hub.publish(Bytes::from_static(b"hi\r\n"));
        hub.finish(ExitInfo {
            exit_code: 2,
            signal: None,
        });

        let first = timeout(Duration::from_secs(1), conn.next_event()).await.unwrap();
        assert_eq!(
            first,
            ServerMessage::Output(Output {
                session_id: id.clone(),
                bytes: b"hi\r\n".to_vec()
            })
        );

        let second = timeout(Duration::from_secs(1), conn.next_event()).await.unwrap();
        assert_eq!(
            second,
            ServerMessage::SessionExit(SessionExit {
                session_id: id,
                exit_code: 2,
                signal: None
            })
        );
        assert!(conn.bound_session().is_none());

        let replies = conn.handle(ClientMessage::Command("x".to_string())).await;
        assert_eq!(error_code(&replies[0]), ErrorCode::SessionRequired);
    }

    #[tokio::test]
    async fn test_next_event_pending_when_unbound() {
        let (_, mut conn) = connection();
        assert!(timeout(Duration::from_millis(50), conn.next_event())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_bound_session() {
        let (registry, mut conn, id) = authed_and_bound().await;
        conn.shutdown();

        assert_eq!(registry.closed(), vec![id]);
        assert_eq!(registry.active_count(), 0);
        assert!(conn.bound_session().is_none());
    }

    #[tokio::test]
    async fn test_drop_closes_bound_session() {
        let (registry, conn, id) = authed_and_bound().await;
        drop(conn);
        assert_eq!(registry.closed(), vec![id]);
    }

    #[test]
    fn test_error_code_mapping() {
        let cases = [
            (SessionError::NotFound("x".into()), ErrorCode::SessionNotFound),
            (SessionError::Inactive("x".into()), ErrorCode::SessionInactive),
            (SessionError::SpawnFailed("x".into()), ErrorCode::SpawnError),
            (SessionError::LimitReached(3), ErrorCode::SessionLimit),
            (SessionError::InvalidSignal("x".into()), ErrorCode::InvalidSignal),
            (
                SessionError::InvalidGeometry { cols: 0, rows: 0 },
                ErrorCode::InvalidGeometry,
            ),
            (SessionError::ResizeFailed("x".into()), ErrorCode::InternalError),
        ];
        for (error, code) in cases {
            assert_eq!(ConnectionError::from(error).code(), code);
        }
        assert!(matches!(
            ConnectionError::from(AuthError::InvalidToken).to_message(),
            ServerMessage::AuthFailure(_)
        ));
    }

    mod ordering {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn output_arrives_in_emission_order(
                chunks in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 1..64),
                    1..32,
                )
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                rt.block_on(async {
                    let (registry, mut conn, id) = authed_and_bound().await;
                    let hub = registry.hub(&id);
                    for chunk in &chunks {
                        hub.publish(Bytes::copy_from_slice(chunk));
                    }

                    for expected in &chunks {
                        let event = timeout(Duration::from_secs(1), conn.next_event())
                            .await
                            .unwrap();
                        let ServerMessage::Output(output) = event else {
                            panic!("expected output, got {event:?}");
                        };
                        assert_eq!(&output.bytes, expected);
                    }
                });
            }
        }
    }
}
