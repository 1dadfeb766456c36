//! IPC client for talking to the service
//!
//! Every call opens a connection, sends one request line and reads one
//! response line. [`ScClient::watch`] keeps its connection open as a
//! [`Subscription`], and [`ScClient::watch_requests`] as a [`SourceRequests`]
//! stream.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::get_socket_path;
use super::listener::MAX_MESSAGE_SIZE;
use super::messages::{Request, Response};
use crate::domain::{
    AggregatedView, ErrorDetails, RefreshReason, SafetyEvent, SourceCatalog, SourceReport, UserId,
};
use crate::events::ScEvent;
use crate::listeners::ListenerUpdate;
use crate::service::RefreshTicket;

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the service socket
#[derive(Debug, Clone)]
pub struct ScClient {
    socket_path: PathBuf,
    timeout: Duration,
    /// Target user; the service defaults to the caller's own
    user_id: Option<UserId>,
    /// Package to claim on source calls
    package_name: Option<String>,
}

impl Default for ScClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    /// Create a client with a custom socket path
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
            user_id: None,
            package_name: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn for_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn as_package(mut self, package_name: Option<String>) -> Self {
        self.package_name = package_name;
        self
    }

    /// Check if the service socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check the service is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        match self.send(Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        match self.send(Request::IsEnabled).await? {
            Response::Enabled { enabled } => Ok(enabled),
            other => Err(unexpected(other)),
        }
    }

    pub async fn push_report(&self, source_id: &str, report: Option<SourceReport>, event: SafetyEvent) -> Result<()> {
        let request = Request::PushReport {
            source_id: source_id.to_string(),
            package_name: self.package_name.clone(),
            user_id: self.user_id,
            report,
            event,
        };
        expect_ok(self.send(request).await?)
    }

    pub async fn read_report(&self, source_id: &str) -> Result<Option<SourceReport>> {
        let request = Request::ReadReport {
            source_id: source_id.to_string(),
            package_name: self.package_name.clone(),
            user_id: self.user_id,
        };
        match self.send(request).await? {
            Response::Report { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn report_error(&self, source_id: &str, details: ErrorDetails) -> Result<()> {
        let request = Request::ReportError {
            source_id: source_id.to_string(),
            package_name: self.package_name.clone(),
            user_id: self.user_id,
            details,
        };
        expect_ok(self.send(request).await?)
    }

    pub async fn refresh(&self, reason: RefreshReason) -> Result<Option<RefreshTicket>> {
        let request = Request::Refresh {
            reason,
            user_id: self.user_id,
        };
        match self.send(request).await? {
            Response::Refreshed { ticket } => Ok(ticket),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_config(&self) -> Result<Option<SourceCatalog>> {
        match self.send(Request::GetConfig).await? {
            Response::Config { catalog } => Ok(catalog),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_view(&self) -> Result<AggregatedView> {
        let request = Request::GetView { user_id: self.user_id };
        match self.send(request).await? {
            Response::View { view } => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    pub async fn dismiss_issue(&self, issue_id: &str) -> Result<()> {
        let request = Request::DismissIssue {
            issue_id: issue_id.to_string(),
            user_id: self.user_id,
        };
        expect_ok(self.send(request).await?)
    }

    pub async fn execute_action(&self, issue_id: &str, action_id: &str) -> Result<()> {
        let request = Request::ExecuteAction {
            issue_id: issue_id.to_string(),
            action_id: action_id.to_string(),
            user_id: self.user_id,
        };
        expect_ok(self.send(request).await?)
    }

    pub async fn clear_all(&self) -> Result<()> {
        expect_ok(self.send(Request::ClearAll).await?)
    }

    pub async fn set_config_override(&self, catalog: SourceCatalog) -> Result<()> {
        expect_ok(self.send(Request::SetConfigOverride { catalog }).await?)
    }

    pub async fn clear_config_override(&self) -> Result<()> {
        expect_ok(self.send(Request::ClearConfigOverride).await?)
    }

    /// Subscribe to view changes for the target user
    pub async fn watch(&self) -> Result<Subscription> {
        let (mut lines, mut writer) = self.connect().await?;
        self.write_request(&mut writer, &Request::Subscribe { user_id: self.user_id })
            .await?;
        match self.read_response(&mut lines).await? {
            Response::Subscribed => Ok(Subscription {
                lines,
                _writer: writer,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Stream refresh and issue-action requests addressed to this client's package
    pub async fn watch_requests(&self) -> Result<SourceRequests> {
        let (mut lines, mut writer) = self.connect().await?;
        let request = Request::WatchRequests {
            package_name: self.package_name.clone(),
            user_id: self.user_id,
        };
        self.write_request(&mut writer, &request).await?;
        match self.read_response(&mut lines).await? {
            Response::Subscribed => Ok(SourceRequests {
                lines,
                _writer: writer,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn connect(&self) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to service socket")?;
        let (read_half, write_half) = stream.into_split();
        Ok((BufReader::new(read_half).lines(), write_half))
    }

    /// Send a request and wait for its response
    async fn send(&self, request: Request) -> Result<Response> {
        debug!(?self.socket_path, ?request, "ScClient: sending request");
        let (mut lines, mut writer) = self.connect().await?;
        self.write_request(&mut writer, &request).await?;
        let response = self.read_response(&mut lines).await?;
        debug!(?response, "ScClient: received response");
        Ok(response)
    }

    async fn write_request(&self, writer: &mut OwnedWriteHalf, request: &Request) -> Result<()> {
        let json = serde_json::to_string(request).context("Failed to serialize request")?;
        if json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", json.len()));
        }
        tokio::time::timeout(self.timeout, async {
            writer.write_all(json.as_bytes()).await.context("Failed to write request")?;
            writer.write_all(b"\n").await.context("Failed to write newline")?;
            writer.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")?
    }

    async fn read_response(&self, lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Response> {
        let line = tokio::time::timeout(self.timeout, lines.next_line())
            .await
            .context("Read timeout")?
            .context("Failed to read response")?
            .ok_or_else(|| eyre::eyre!("Service closed the connection"))?;
        let response: Response = serde_json::from_str(line.trim()).context("Failed to parse service response")?;
        match response {
            Response::Error { kind, message } => Err(eyre::eyre!("Service error ({:?}): {}", kind, message)),
            response => Ok(response),
        }
    }
}

/// Live update stream from [`ScClient::watch`]
pub struct Subscription {
    lines: Lines<BufReader<OwnedReadHalf>>,
    /// Held so the service does not see the connection close
    _writer: OwnedWriteHalf,
}

impl Subscription {
    /// Wait for the next update; `None` once the service hangs up
    pub async fn next(&mut self) -> Result<Option<ListenerUpdate>> {
        while let Some(line) = self.lines.next_line().await.context("Failed to read update")? {
            match serde_json::from_str::<Response>(line.trim()).context("Failed to parse update")? {
                Response::Update { update } => return Ok(Some(update)),
                other => debug!(?other, "Subscription: ignoring non-update response"),
            }
        }
        Ok(None)
    }
}

/// Request stream from [`ScClient::watch_requests`]
pub struct SourceRequests {
    lines: Lines<BufReader<OwnedReadHalf>>,
    _writer: OwnedWriteHalf,
}

impl SourceRequests {
    /// Wait for the next request; `None` once the service hangs up
    pub async fn next(&mut self) -> Result<Option<ScEvent>> {
        while let Some(line) = self.lines.next_line().await.context("Failed to read request")? {
            match serde_json::from_str::<Response>(line.trim()).context("Failed to parse request")? {
                Response::SourceRequest { event } => return Ok(Some(event)),
                other => debug!(?other, "SourceRequests: ignoring response"),
            }
        }
        Ok(None)
    }
}

fn expect_ok(response: Response) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> eyre::Error {
    eyre::eyre!("Unexpected response: {:?}", response)
}
