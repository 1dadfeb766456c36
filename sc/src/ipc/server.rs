//! IPC server: accepts connections and dispatches requests to the core

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::listener::{Frame, MAX_MESSAGE_SIZE, parse_request, read_frame, send_response};
use super::messages::{Request, Response};
use crate::domain::{CallerContext, Uid, UserId, user_id_of};
use crate::listeners::{DataChangedListener, ListenerError, ListenerHandle, ListenerUpdate};
use crate::service::CoordinationCore;

/// Updates buffered per subscriber connection
const UPDATE_BUFFER: usize = 64;

/// How long one delivery may wait on a full subscriber buffer
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Listener endpoint backed by a subscriber's socket connection
pub struct SocketListener {
    tx: mpsc::Sender<ListenerUpdate>,
    timeout: Duration,
}

impl SocketListener {
    pub fn new(tx: mpsc::Sender<ListenerUpdate>) -> Self {
        Self {
            tx,
            timeout: DELIVERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DataChangedListener for SocketListener {
    async fn on_update(&self, update: ListenerUpdate) -> Result<(), ListenerError> {
        match tokio::time::timeout(self.timeout, self.tx.send(update)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ListenerError::Disconnected),
            Err(_) => Err(ListenerError::TimedOut),
        }
    }
}

/// Accept connections until `shutdown` fires
pub async fn serve(listener: UnixListener, core: Arc<CoordinationCore>, mut shutdown: mpsc::Receiver<()>) {
    info!("IPC server accepting connections");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let core = core.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, core).await {
                            warn!(error = %e, "IPC connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept IPC connection"),
            },
            _ = shutdown.recv() => {
                debug!("serve: shutdown received");
                break;
            }
        }
    }
    info!("IPC server stopped");
}

/// Serve one client connection
///
/// Requests are answered one line at a time until the client hangs up. A
/// `Subscribe` request turns the connection into an update stream and a
/// `WatchRequests` request into a feed of source requests.
pub async fn handle_connection(stream: UnixStream, core: Arc<CoordinationCore>) -> Result<()> {
    let uid = stream.peer_cred().context("Failed to read peer credentials")?.uid();
    debug!(uid, "handle_connection: accepted");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let line = match read_frame(&mut reader).await? {
            Frame::Line(line) => line,
            Frame::Eof => break,
            Frame::TooLarge => {
                warn!(uid, "IPC message over {} bytes, closing connection", MAX_MESSAGE_SIZE);
                let response = Response::protocol_error(format!("Message larger than {} bytes", MAX_MESSAGE_SIZE));
                return send_response(&mut write_half, &response).await;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request = match parse_request(&line) {
            Ok(request) => request,
            Err(response) => {
                send_response(&mut write_half, &response).await?;
                continue;
            }
        };
        match request {
            Request::Subscribe { user_id } => {
                return stream_updates(&core, uid, user_id, reader, write_half).await;
            }
            Request::WatchRequests { package_name, user_id } => {
                return stream_requests(&core, caller(uid, user_id, package_name), reader, write_half).await;
            }
            _ => {}
        }
        let response = dispatch(&core, uid, request).await;
        send_response(&mut write_half, &response).await?;
    }

    debug!(uid, "handle_connection: client hung up");
    Ok(())
}

fn caller(uid: Uid, user_id: Option<UserId>, package_name: Option<String>) -> CallerContext {
    CallerContext {
        uid,
        package_name,
        user_id: user_id.unwrap_or_else(|| user_id_of(uid)),
    }
}

/// Run one request against the core
pub async fn dispatch(core: &CoordinationCore, uid: Uid, request: Request) -> Response {
    debug!(uid, ?request, "dispatch: called");
    let result = match request {
        Request::Ping => Ok(Response::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        Request::IsEnabled => core
            .is_enabled(&caller(uid, None, None))
            .map(|enabled| Response::Enabled { enabled }),
        Request::PushReport {
            source_id,
            package_name,
            user_id,
            report,
            event,
        } => core
            .push_source_report(&caller(uid, user_id, package_name), &source_id, report, &event)
            .await
            .map(|()| Response::Ok),
        Request::ReadReport {
            source_id,
            package_name,
            user_id,
        } => core
            .read_source_report(&caller(uid, user_id, package_name), &source_id)
            .await
            .map(|report| Response::Report { report }),
        Request::ReportError {
            source_id,
            package_name,
            user_id,
            details,
        } => core
            .report_source_error(&caller(uid, user_id, package_name), &source_id, details)
            .await
            .map(|()| Response::Ok),
        Request::Refresh { reason, user_id } => core
            .refresh(&caller(uid, user_id, None), reason)
            .await
            .map(|ticket| Response::Refreshed { ticket }),
        Request::GetConfig => core
            .get_config(&caller(uid, None, None))
            .await
            .map(|catalog| Response::Config { catalog }),
        Request::GetView { user_id } => core
            .get_aggregated_view(&caller(uid, user_id, None))
            .await
            .map(|view| Response::View { view }),
        Request::Subscribe { .. } | Request::WatchRequests { .. } => {
            Ok(Response::protocol_error("Streaming requests are handled per connection"))
        }
        Request::DismissIssue { issue_id, user_id } => core
            .dismiss_issue(&caller(uid, user_id, None), &issue_id)
            .await
            .map(|()| Response::Ok),
        Request::ExecuteAction {
            issue_id,
            action_id,
            user_id,
        } => core
            .execute_issue_action(&caller(uid, user_id, None), &issue_id, &action_id)
            .await
            .map(|()| Response::Ok),
        Request::ClearAll => core.clear_all(&caller(uid, None, None)).await.map(|()| Response::Ok),
        Request::SetConfigOverride { catalog } => core
            .set_config_override(&caller(uid, None, None), catalog)
            .await
            .map(|()| Response::Ok),
        Request::ClearConfigOverride => core
            .clear_config_override(&caller(uid, None, None))
            .await
            .map(|()| Response::Ok),
    };
    result.unwrap_or_else(Response::from)
}

/// True once the client has hung up or broken framing
///
/// Anything else a streaming client sends is ignored.
async fn client_gone<R>(reader: &mut R) -> bool
where
    R: AsyncBufRead + Unpin,
{
    !matches!(read_frame(reader).await, Ok(Frame::Line(_)))
}

/// Subscribe a socket-backed handle and pump updates until the client leaves
async fn stream_updates<R, W>(
    core: &CoordinationCore,
    uid: Uid,
    user_id: Option<UserId>,
    mut reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let caller = caller(uid, user_id, None);
    let (tx, mut rx) = mpsc::channel(UPDATE_BUFFER);
    let handle = ListenerHandle::new(Arc::new(SocketListener::new(tx)));

    if let Err(e) = core.subscribe(&caller, handle.clone()).await {
        return send_response(&mut writer, &Response::from(e)).await;
    }
    send_response(&mut writer, &Response::Subscribed).await?;
    info!(id = %handle.id(), uid, user_id = caller.user_id, "Subscriber connected");

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                if let Err(e) = send_response(&mut writer, &Response::Update { update }).await {
                    debug!(error = %e, "stream_updates: write failed");
                    break;
                }
            }
            gone = client_gone(&mut reader) => if gone { break },
        }
    }

    info!(id = %handle.id(), uid, "Subscriber disconnected");
    core.drop_listener(&handle, caller.user_id).await;
    Ok(())
}

/// Forward refresh and issue-action requests for one source package
///
/// When the call degrades to a no-op the stream ends right after `Subscribed`.
async fn stream_requests<R, W>(
    core: &CoordinationCore,
    caller: CallerContext,
    mut reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut feed = match core.watch_requests(&caller) {
        Ok(Some(feed)) => feed,
        Ok(None) => return send_response(&mut writer, &Response::Subscribed).await,
        Err(e) => return send_response(&mut writer, &Response::from(e)).await,
    };
    send_response(&mut writer, &Response::Subscribed).await?;
    info!(uid = caller.uid, user_id = caller.user_id, package = ?caller.package_name, "Source watching requests");

    loop {
        tokio::select! {
            event = feed.next() => {
                let Some(event) = event else { break };
                if let Err(e) = send_response(&mut writer, &Response::SourceRequest { event }).await {
                    debug!(error = %e, "stream_requests: write failed");
                    break;
                }
            }
            gone = client_gone(&mut reader) => if gone { break },
        }
    }

    info!(uid = caller.uid, package = ?caller.package_name, "Source stopped watching requests");
    Ok(())
}
