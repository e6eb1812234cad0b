#![allow(dead_code)]

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_lsp::{
    lsp_types::{
        notification::{
            DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, Exit, Initialized,
        },
        request::{Initialize, Shutdown},
        InitializeResult, ServerInfo, Url,
    },
    router::Router,
    ErrorCode, MainLoop, ResponseError,
};
use rpmspec_lsp_client::{ClientConfig, ClientState, Extension, TransportEvent};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

/// What the mock server has seen so far, plus knobs for misbehaving.
#[derive(Default)]
pub struct Recorded {
    pub accepted: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub opened: Mutex<Vec<Url>>,
    /// Number of upcoming `initialize` requests to answer with an error.
    pub reject_initialize: AtomicUsize,
    /// Never answer `shutdown`.
    pub stall_shutdown: AtomicBool,
}

/// Minimal language server on a loopback port.
pub struct MockServer {
    pub port: u16,
    pub recorded: Arc<Recorded>,
    disconnect: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock server");
        let port = listener.local_addr().expect("No local address").port();
        let recorded = Arc::new(Recorded::default());
        let (disconnect, _) = broadcast::channel(4);

        let task = tokio::spawn(accept_loop(listener, recorded.clone(), disconnect.clone()));

        Self {
            port,
            recorded,
            disconnect,
            task,
        }
    }

    pub fn accepted(&self) -> usize {
        self.recorded.accepted.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.recorded.shutdowns.load(Ordering::SeqCst)
    }

    pub fn reject_initialize(&self, count: usize) {
        self.recorded.reject_initialize.store(count, Ordering::SeqCst);
    }

    pub fn stall_shutdown(&self) {
        self.recorded.stall_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Url> {
        self.recorded.opened.lock().unwrap().clone()
    }

    /// Drop every live connection, as a restarting server would.
    pub fn drop_connections(&self) {
        let _ = self.disconnect.send(());
    }

    pub async fn wait_for_accepted(&self, count: usize, within: Duration) -> bool {
        wait_until(within, || self.accepted() >= count).await
    }

    pub async fn wait_for_opened(&self, count: usize, within: Duration) -> bool {
        wait_until(within, || self.opened().len() >= count).await
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
        let _ = self.disconnect.send(());
    }
}

async fn accept_loop(
    listener: TcpListener,
    recorded: Arc<Recorded>,
    disconnect: broadcast::Sender<()>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        recorded.accepted.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(stream, recorded.clone(), disconnect.subscribe()));
    }
}

async fn serve(stream: TcpStream, recorded: Arc<Recorded>, mut disconnect: broadcast::Receiver<()>) {
    let (mainloop, _client) = MainLoop::new_server(|_| server_router(recorded));
    let (reader, writer) = stream.into_split();
    tokio::select! {
        _ = mainloop.run_buffered(reader.compat(), writer.compat_write()) => {}
        _ = disconnect.recv() => {}
    }
}

fn server_router(recorded: Arc<Recorded>) -> Router<Arc<Recorded>> {
    let mut router = Router::new(recorded);
    router
        .request::<Initialize, _>(|st, _| {
            let reject = st
                .reject_initialize
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            async move {
                if reject {
                    return Err(ResponseError::new(ErrorCode::INTERNAL_ERROR, "not ready"));
                }
                Ok(InitializeResult {
                    server_info: Some(ServerInfo {
                        name: "mock-rpmspec".to_string(),
                        version: None,
                    }),
                    ..InitializeResult::default()
                })
            }
        })
        .notification::<Initialized>(|_, _| ControlFlow::Continue(()))
        .notification::<DidOpenTextDocument>(|st, params| {
            st.opened.lock().unwrap().push(params.text_document.uri);
            ControlFlow::Continue(())
        })
        .notification::<DidChangeTextDocument>(|_, _| ControlFlow::Continue(()))
        .notification::<DidCloseTextDocument>(|_, _| ControlFlow::Continue(()))
        .request::<Shutdown, _>(|st, ()| {
            st.shutdowns.fetch_add(1, Ordering::SeqCst);
            let stall = st.stall_shutdown.load(Ordering::SeqCst);
            async move {
                if stall {
                    sleep(Duration::from_secs(60)).await;
                }
                Ok(())
            }
        })
        .notification::<Exit>(|_, ()| ControlFlow::Break(Ok(())));
    router
}

pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A loopback port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    listener.local_addr().expect("No local address").port()
}

pub fn config(port: u16, reconnect_delay_ms: u64) -> ClientConfig {
    ClientConfig {
        port,
        reconnect_delay_ms,
        ..ClientConfig::default()
    }
}

pub async fn wait_for_state(extension: &Extension, target: ClientState, within: Duration) -> bool {
    let Some(client) = extension.client() else {
        return false;
    };
    let mut state = client.subscribe_state();
    timeout(within, state.wait_for(|s| *s == target))
        .await
        .is_ok_and(|r| r.is_ok())
}

/// Receive events until one matches `stop`, collecting all of them.
pub async fn collect_events_until(
    events: &mut broadcast::Receiver<TransportEvent>,
    within: Duration,
    mut stop: impl FnMut(&TransportEvent) -> bool,
) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let done = stop(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            _ => return seen,
        }
    }
}
