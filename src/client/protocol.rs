//! Protocol client bound to a connection factory.
//!
//! Every transport handed out by the factory gets its own `async-lsp` main
//! loop and `initialize` handshake. The client itself, its state channel and
//! its set of open documents outlive individual transports.

use std::{
    collections::HashMap, mem, ops::ControlFlow, process, result::Result as StdResult,
    sync::Arc, time::Duration,
};

use async_lsp::{
    lsp_types::{
        notification::{LogMessage, PublishDiagnostics, ShowMessage},
        request::{RegisterCapability, WorkDoneProgressCreate, WorkspaceConfiguration},
        ClientCapabilities, ClientInfo, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
        DidOpenTextDocumentParams, InitializeParams, InitializeResult, InitializedParams,
        MessageType, TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, Url,
        VersionedTextDocumentIdentifier, WorkspaceFolder,
    },
    router::Router,
    LanguageServer, MainLoop, ServerSocket,
};
use tokio::{
    sync::{watch, Mutex},
    task::{JoinError, JoinHandle},
    time::timeout,
};
use tokio_util::{
    compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt},
    sync::CancellationToken,
};

use super::{
    config::{ClientConfig, DocumentSelector},
    state::{ClientState, StateCell},
};
use crate::{
    error::{ClientError, Result},
    transport::{ConnectionFactory, InitialConnectPolicy, Transport},
};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Event that breaks a session's main loop.
struct Stop;

struct RouterState {
    channel: Arc<str>,
}

/// Handlers for server-to-client traffic.
fn client_router(channel: Arc<str>) -> Router<RouterState> {
    let mut router = Router::new(RouterState { channel });
    router
        .notification::<LogMessage>(|st, params| {
            log_server_message(&st.channel, params.typ, &params.message);
            ControlFlow::Continue(())
        })
        .notification::<ShowMessage>(|st, params| {
            log_server_message(&st.channel, params.typ, &params.message);
            ControlFlow::Continue(())
        })
        .notification::<PublishDiagnostics>(|st, params| {
            tracing::debug!(
                channel = %st.channel,
                uri = %params.uri,
                count = params.diagnostics.len(),
                "diagnostics published"
            );
            ControlFlow::Continue(())
        })
        .request::<WorkspaceConfiguration, _>(|_, params| {
            let items = params.items.len();
            async move { Ok(vec![serde_json::Value::Null; items]) }
        })
        .request::<RegisterCapability, _>(|_, _| async { Ok(()) })
        .request::<WorkDoneProgressCreate, _>(|_, _| async { Ok(()) })
        .unhandled_notification(|_, notif| {
            tracing::debug!("ignoring server notification {}", notif.method);
            ControlFlow::Continue(())
        })
        .event::<Stop>(|_, _| ControlFlow::Break(Ok(())));
    router
}

fn log_server_message(channel: &str, typ: MessageType, message: &str) {
    if typ == MessageType::ERROR {
        tracing::error!(channel, "{message}");
    } else if typ == MessageType::WARNING {
        tracing::warn!(channel, "{message}");
    } else if typ == MessageType::INFO {
        tracing::info!(channel, "{message}");
    } else {
        tracing::debug!(channel, "{message}");
    }
}

struct Shared {
    name: String,
    output_channel: Arc<str>,
    selector: DocumentSelector,
    workspace: Option<WorkspaceFolder>,
    /// Give up when the first session fails its handshake.
    fail_fast: bool,
    state: StateCell,
    /// Socket of the current session; `None` while disconnected.
    server: Mutex<Option<ServerSocket>>,
    documents: Mutex<HashMap<Url, TextDocumentItem>>,
}

impl Shared {
    fn initialize_params(&self) -> InitializeParams {
        InitializeParams {
            process_id: Some(process::id()),
            client_info: Some(ClientInfo {
                name: self.name.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            workspace_folders: self.workspace.clone().map(|folder| vec![folder]),
            capabilities: ClientCapabilities::default(),
            ..InitializeParams::default()
        }
    }
}

/// One protocol session over one transport.
struct Session {
    id: u64,
    server: ServerSocket,
    main_loop: JoinHandle<async_lsp::Result<()>>,
}

impl Session {
    fn spawn(transport: Transport, channel: Arc<str>) -> Self {
        let id = transport.id();
        let (mainloop, server) = MainLoop::new_client(|_| client_router(channel));
        let (reader, writer) = transport.into_split();
        let main_loop = tokio::spawn(async move {
            mainloop
                .run_buffered(reader.compat(), writer.compat_write())
                .await
        });
        Self {
            id,
            server,
            main_loop,
        }
    }

    async fn handshake(mut server: ServerSocket, params: InitializeParams) -> Result<InitializeResult> {
        let result = server.initialize(params).await?;
        server.initialized(InitializedParams {})?;
        Ok(result)
    }

    /// Break the main loop, dropping the transport.
    async fn close(&mut self) {
        if self.server.emit(Stop).is_err() {
            tracing::debug!(session = self.id, "main loop already gone");
        }
        let stopped = timeout(CLOSE_TIMEOUT, &mut self.main_loop).await;
        match stopped {
            Ok(result) => log_session_end(self.id, result),
            Err(_) => {
                tracing::warn!(session = self.id, "main loop did not stop, aborting");
                self.main_loop.abort();
            }
        }
    }

    /// LSP `shutdown` + `exit`, then close.
    async fn shutdown(mut self) -> Result<()> {
        let mut server = self.server.clone();
        let result = match timeout(SHUTDOWN_TIMEOUT, server.shutdown(())).await {
            Ok(Ok(())) => {
                if let Err(e) = server.exit(()) {
                    tracing::debug!(session = self.id, "exit notification not sent: {e}");
                }
                Ok(())
            }
            Ok(Err(e)) => Err(ClientError::Shutdown(e.to_string()).into()),
            Err(_) => Err(ClientError::Shutdown(format!(
                "no response within {SHUTDOWN_TIMEOUT:?}"
            ))
            .into()),
        };
        self.close().await;
        result
    }
}

fn log_session_end(id: u64, result: StdResult<async_lsp::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => tracing::info!(session = id, "session ended"),
        Ok(Err(e)) => tracing::info!(session = id, "session ended: {e}"),
        Err(e) => tracing::warn!(session = id, "session task failed: {e}"),
    }
}

/// The single protocol-client instance of an activation.
pub struct ProtocolClient {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl ProtocolClient {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        let workspace = config.root_uri().map(|uri| WorkspaceFolder {
            name: config
                .root
                .as_deref()
                .and_then(|root| root.file_name())
                .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().into_owned()),
            uri,
        });

        Self {
            shared: Arc::new(Shared {
                name: config.display_name(),
                output_channel: Arc::from(config.output_channel.as_str()),
                selector: config.document_selector.clone(),
                workspace,
                fail_fast: config.initial_connect == InitialConnectPolicy::FailFast,
                state: StateCell::new(),
                server: Mutex::new(None),
                documents: Mutex::new(HashMap::new()),
            }),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn output_channel(&self) -> &str {
        &self.shared.output_channel
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.shared.state.get()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Whether a document belongs to this client according to its selector.
    #[must_use]
    pub fn serves(&self, uri: &Url, language_id: &str) -> bool {
        self.shared.selector.matches(uri, language_id)
    }

    /// Socket of the current session, if connected and initialized.
    pub async fn server(&self) -> Option<ServerSocket> {
        self.shared.server.lock().await.clone()
    }

    /// Start the session loop. Returns once the client is `Starting`; it
    /// becomes `Running` after the first successful handshake.
    pub fn start<F: ConnectionFactory>(&mut self, factory: F) -> Result<()> {
        if !self.shared.state.advance(ClientState::Starting) {
            return Err(ClientError::AlreadyStarted.into());
        }
        tracing::info!(name = %self.shared.name, "starting client");

        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(run_sessions(shared, factory, shutdown)));
        Ok(())
    }

    /// Stop the client and wait for the session loop to finish.
    ///
    /// Returns the loop's failure, if it had one. Calling this again after the
    /// client stopped is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return match self.state() {
                ClientState::Uninitialized => Err(ClientError::NotStarted.into()),
                _ => Ok(()),
            };
        };

        tracing::info!(name = %self.shared.name, "stopping client");
        self.shared.state.advance(ClientState::Stopping);
        self.shutdown.cancel();

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(ClientError::TaskFailed(e.to_string()).into()),
        };
        self.shared.state.advance(ClientState::Stopped);
        result
    }

    /// Track an opened document and announce it to the server. Returns
    /// `false` if the selector does not cover it.
    pub async fn did_open(&self, document: TextDocumentItem) -> Result<bool> {
        if !self.serves(&document.uri, &document.language_id) {
            return Ok(false);
        }
        let mut documents = self.shared.documents.lock().await;
        documents.insert(document.uri.clone(), document.clone());
        if let Some(server) = self.shared.server.lock().await.as_mut() {
            server.did_open(DidOpenTextDocumentParams {
                text_document: document,
            })?;
        }
        Ok(true)
    }

    /// Replace the full text of a tracked document. Returns `false` for
    /// documents that are not open.
    pub async fn did_change(&self, uri: &Url, version: i32, text: String) -> Result<bool> {
        let mut documents = self.shared.documents.lock().await;
        let Some(document) = documents.get_mut(uri) else {
            return Ok(false);
        };
        document.version = version;
        document.text.clone_from(&text);
        if let Some(server) = self.shared.server.lock().await.as_mut() {
            server.did_change(DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version,
                },
                content_changes: vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text,
                }],
            })?;
        }
        Ok(true)
    }

    /// Forget a tracked document. Returns `false` if it was not open.
    pub async fn did_close(&self, uri: &Url) -> Result<bool> {
        let mut documents = self.shared.documents.lock().await;
        if documents.remove(uri).is_none() {
            return Ok(false);
        }
        if let Some(server) = self.shared.server.lock().await.as_mut() {
            server.did_close(DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
            })?;
        }
        Ok(true)
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_sessions<F: ConnectionFactory>(
    shared: Arc<Shared>,
    mut factory: F,
    shutdown: CancellationToken,
) -> Result<()> {
    let result = session_loop(&shared, &mut factory, &shutdown).await;
    if let Err(e) = &result {
        tracing::error!(name = %shared.name, "client stopped: {e}");
    }
    *shared.server.lock().await = None;
    shared.state.advance(ClientState::Stopping);
    shared.state.advance(ClientState::Stopped);
    result
}

async fn session_loop<F: ConnectionFactory>(
    shared: &Shared,
    factory: &mut F,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut first = true;
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            next = factory.next_transport() => next,
        };
        let transport = match next {
            Ok(transport) => transport,
            Err(e) if e.as_client() == Some(&ClientError::ConnectorStopped) => {
                tracing::debug!("connection factory exhausted");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut session = Session::spawn(transport, shared.output_channel.clone());
        let id = session.id;

        let handshake = tokio::select! {
            () = shutdown.cancelled() => {
                session.close().await;
                return Ok(());
            }
            result = &mut session.main_loop => {
                log_session_end(id, result);
                Err(ClientError::Handshake(
                    "connection closed before the initialize response".to_string(),
                ))
            }
            result = timeout(
                INIT_TIMEOUT,
                Session::handshake(session.server.clone(), shared.initialize_params()),
            ) => match result {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => {
                    session.close().await;
                    Err(ClientError::Handshake(e.to_string()))
                }
                Err(_) => {
                    session.close().await;
                    Err(ClientError::Handshake(format!(
                        "no initialize response within {INIT_TIMEOUT:?}"
                    )))
                }
            },
        };
        let was_first = mem::replace(&mut first, false);

        let result = match handshake {
            Ok(result) => result,
            Err(e) if was_first && shared.fail_fast => return Err(e.into()),
            Err(e) => {
                tracing::warn!(session = id, "{e}");
                continue;
            }
        };

        let server_name = result.server_info.map(|info| info.name);
        tracing::info!(session = id, server = ?server_name, "initialized");
        if let Err(e) = attach(shared, &session.server).await {
            tracing::warn!(session = id, "re-opening documents failed: {e}");
            session.close().await;
            continue;
        }
        shared.state.advance(ClientState::Running);

        tokio::select! {
            result = &mut session.main_loop => {
                *shared.server.lock().await = None;
                log_session_end(id, result);
            }
            () = shutdown.cancelled() => {
                *shared.server.lock().await = None;
                return session.shutdown().await;
            }
        }
    }
}

/// Publish the session's socket and re-open tracked documents on it.
async fn attach(shared: &Shared, server: &ServerSocket) -> Result<()> {
    let documents = shared.documents.lock().await;
    let mut server = server.clone();
    for document in documents.values() {
        server.did_open(DidOpenTextDocumentParams {
            text_document: document.clone(),
        })?;
    }
    if !documents.is_empty() {
        tracing::info!("re-opened {} document(s)", documents.len());
    }
    *shared.server.lock().await = Some(server);
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;

    struct NoTransports;

    impl ConnectionFactory for NoTransports {
        fn next_transport(&mut self) -> BoxFuture<'_, Result<Transport>> {
            Box::pin(async { Err(ClientError::ConnectorStopped.into()) })
        }
    }

    struct Pending;

    impl ConnectionFactory for Pending {
        fn next_transport(&mut self) -> BoxFuture<'_, Result<Transport>> {
            Box::pin(futures::future::pending())
        }
    }

    fn spec_file(path: &str) -> TextDocumentItem {
        TextDocumentItem {
            uri: Url::parse(path).unwrap(),
            language_id: "rpmspec".to_string(),
            version: 1,
            text: "Name: foo\n".to_string(),
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_fails() {
        let mut client = ProtocolClient::new(&ClientConfig::default());
        let err = client.stop().await.unwrap_err();
        assert_eq!(err.as_client(), Some(&ClientError::NotStarted));
    }

    #[tokio::test]
    async fn test_second_start_fails() {
        let mut client = ProtocolClient::new(&ClientConfig::default());
        client.start(Pending).unwrap();
        let err = client.start(Pending).unwrap_err();
        assert_eq!(err.as_client(), Some(&ClientError::AlreadyStarted));
        assert_eq!(client.state(), ClientState::Starting);

        client.stop().await.unwrap();
        assert_eq!(client.state(), ClientState::Stopped);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_factory_stops_client() {
        let mut client = ProtocolClient::new(&ClientConfig::default());
        let mut state = client.subscribe_state();
        client.start(NoTransports).unwrap();

        timeout(Duration::from_secs(1), state.wait_for(|s| *s == ClientState::Stopped))
            .await
            .unwrap()
            .unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_documents_tracked_while_disconnected() {
        let client = ProtocolClient::new(&ClientConfig::default());
        let doc = spec_file("file:///src/foo.spec");

        assert!(client.did_open(doc.clone()).await.unwrap());
        assert!(client
            .did_change(&doc.uri, 2, "Name: bar\n".to_string())
            .await
            .unwrap());
        let tracked = client.shared.documents.lock().await.get(&doc.uri).cloned();
        assert_eq!(tracked.map(|d| (d.version, d.text)), Some((2, "Name: bar\n".to_string())));

        assert!(client.did_close(&doc.uri).await.unwrap());
        assert!(!client.did_close(&doc.uri).await.unwrap());
    }

    #[tokio::test]
    async fn test_unserved_documents_are_ignored() {
        let client = ProtocolClient::new(&ClientConfig::default());
        let mut doc = spec_file("file:///src/setup.py");
        doc.language_id = "python".to_string();

        assert!(!client.did_open(doc.clone()).await.unwrap());
        assert!(!client.did_change(&doc.uri, 2, String::new()).await.unwrap());
    }
}
