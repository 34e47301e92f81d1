//! Async probe client
//!
//! Wraps a [`Session`] around a [`ProbeTransport`]. A background reader task
//! feeds incoming datagrams through the session, sends whatever the session
//! asks for (upload chunks, replay frames, connect retries) and broadcasts
//! the resulting [`SessionEvent`]s. Command methods send one request and wait
//! for the event that ends it, under the configured [`AckPolicy`].

use std::sync::Arc;

use bytes::Bytes;
use canbadger_proto::commands::Gpio;
use canbadger_proto::transfer::DirEntry;
use canbadger_proto::uds::{HijackResponse, SecurityHijack, StartSession};
use canbadger_proto::{ActionKind, Message, MitmRule, ProbeSettings, ReplayQueue, UdsResponse};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{AckPolicy, ClientConfig};
use crate::error::{ClientError, SessionError};
use crate::event::SessionEvent;
use crate::session::{LinkState, OperationKind, Session, UdsLink};
use crate::transport::{ProbeTransport, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connected client for one probe
pub struct ProbeClient {
    transport: Arc<dyn ProbeTransport>,
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<SessionEvent>,
    ack: AckPolicy,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeClient {
    /// Create a client over `transport` and start its reader task.
    /// Call [`ProbeClient::connect`] before issuing commands.
    pub fn new(transport: Arc<dyn ProbeTransport>, config: &ClientConfig) -> Self {
        let session = Session::new(transport.reply_port(), config.session, config.replay);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client = Self {
            transport,
            session: Arc::new(Mutex::new(session)),
            events,
            ack: config.ack,
            reader: Mutex::new(None),
        };
        client.start_reader();
        client
    }

    fn start_reader(&self) {
        let transport = self.transport.clone();
        let session = self.session.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            loop {
                let datagram = match transport.recv().await {
                    Ok(datagram) => datagram,
                    Err(TransportError::ConnectionClosed) => {
                        debug!("Transport closed, reader exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Receive failed");
                        continue;
                    }
                };

                let reaction = session.lock().handle_datagram(&datagram);
                let reaction = match reaction {
                    Ok(reaction) => reaction,
                    Err(e) => {
                        warn!(error = %e, raw = %hex::encode(&datagram), "Dropping datagram");
                        let _ = events.send(SessionEvent::Error(e));
                        continue;
                    }
                };

                for outgoing in &reaction.outbound {
                    let raw = outgoing.encode();
                    if let Err(e) = transport.send(&raw).await {
                        error!(error = %e, "Follow-up send failed");
                    }
                }
                for event in reaction.events {
                    // no subscribers is fine
                    let _ = events.send(event);
                }
            }
        });

        *self.reader.lock() = Some(handle);
    }

    /// Subscribe to every event the session produces, frames included
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.session.lock().state()
    }

    pub fn uds_link(&self) -> UdsLink {
        self.session.lock().uds_link()
    }

    pub fn is_busy(&self) -> bool {
        self.session.lock().is_busy()
    }

    async fn send_raw(&self, raw: &Bytes) -> Result<(), ClientError> {
        self.transport.send(raw).await?;
        Ok(())
    }

    /// Wait for the first event accepted by `matches`.
    ///
    /// The policy timeout is one deadline for the whole wait, pushed back only
    /// by transfer progress or a re-send. When it passes, `resend` is sent
    /// again while the policy allows. A datagram the session rejects fails the wait.
    /// `on_abort` runs whenever the wait fails.
    async fn wait_for<F>(
        &self,
        rx: &mut broadcast::Receiver<SessionEvent>,
        what: &str,
        resend: Option<&Bytes>,
        mut matches: F,
        on_abort: impl FnOnce(),
    ) -> Result<SessionEvent, ClientError>
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let timeout = self.ack.timeout();
        let mut deadline = timeout.map(|t| Instant::now() + t);
        let mut resends_left = if resend.is_some() { self.ack.resends() } else { 0 };
        loop {
            let next = match deadline {
                None => Some(rx.recv().await),
                Some(deadline) => tokio::time::timeout_at(deadline, rx.recv()).await.ok(),
            };

            match next {
                Some(Ok(event)) if matches(&event) => return Ok(event),
                Some(Ok(SessionEvent::Error(error))) => {
                    debug!(what, error = %error, "Rejected datagram while waiting");
                    on_abort();
                    return Err(error.into());
                }
                Some(Ok(SessionEvent::TransferProgress { .. })) => {
                    deadline = timeout.map(|t| Instant::now() + t);
                }
                Some(Ok(_)) => continue,
                Some(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Event receiver lagged");
                    continue;
                }
                Some(Err(broadcast::error::RecvError::Closed)) => {
                    on_abort();
                    return Err(ClientError::Closed);
                }
                None if resends_left > 0 => {
                    resends_left -= 1;
                    if let Some(raw) = resend {
                        debug!(what, resends_left, "No reply, re-sending");
                        if let Err(e) = self.send_raw(raw).await {
                            on_abort();
                            return Err(e);
                        }
                    }
                    deadline = timeout.map(|t| Instant::now() + t);
                }
                None => {
                    on_abort();
                    return Err(ClientError::Timeout(what.to_string()));
                }
            }
        }
    }

    /// Run one exclusive operation to completion
    async fn run<F>(&self, op: OperationKind, build: F) -> Result<SessionEvent, ClientError>
    where
        F: FnOnce(&mut Session) -> Result<Message, SessionError>,
    {
        let mut rx = self.events.subscribe();
        let msg = build(&mut *self.session.lock())?;
        debug!(%op, action = %msg.action, "Sending command");
        let raw = msg.encode();
        if let Err(e) = self.send_raw(&raw).await {
            self.session.lock().abort();
            return Err(e);
        }

        let resend = op.is_idempotent().then_some(&raw);
        let session = self.session.clone();
        let event = self
            .wait_for(
                &mut rx,
                &op.to_string(),
                resend,
                |event| event.completes(op),
                move || {
                    session.lock().abort();
                },
            )
            .await?;

        match event {
            SessionEvent::OperationFailed { error, .. } => Err(error.into()),
            event => Ok(event),
        }
    }

    // =========================================================================
    // Link
    // =========================================================================

    /// Send CONNECT and wait for the probe to answer
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut rx = self.events.subscribe();
        let outgoing = self.session.lock().connect();
        info!(probe = %self.transport.probe_addr(), reply_port = self.transport.reply_port(), "Connecting to probe");
        let raw = outgoing.encode();
        self.send_raw(&raw).await?;
        self.wait_for(
            &mut rx,
            "connect",
            Some(&raw),
            |event| matches!(event, SessionEvent::Connected),
            || {},
        )
        .await?;
        Ok(())
    }

    /// Request the settings blob and wait for it
    pub async fn settings(&self) -> Result<ProbeSettings, ClientError> {
        let mut rx = self.events.subscribe();
        let raw = self.session.lock().request_settings()?.encode();
        self.send_raw(&raw).await?;
        match self
            .wait_for(
                &mut rx,
                "settings",
                Some(&raw),
                |event| matches!(event, SessionEvent::SettingsReceived(_)),
                || {},
            )
            .await?
        {
            SessionEvent::SettingsReceived(settings) => Ok(settings),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn update_settings(&self, settings: &ProbeSettings) -> Result<(), ClientError> {
        self.run(OperationKind::SettingsUpdate, |s| s.update_settings(settings))
            .await?;
        Ok(())
    }

    pub async fn update_setting(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.run(OperationKind::SettingsUpdate, |s| s.update_setting(key, value))
            .await?;
        Ok(())
    }

    /// Persist the current settings to the probe's EEPROM
    pub async fn save_settings(&self, file_name: Option<&str>) -> Result<(), ClientError> {
        self.run(OperationKind::EepromSave, |s| s.save_settings(file_name))
            .await?;
        Ok(())
    }

    pub async fn enable_test_mode(&self) -> Result<(), ClientError> {
        self.run(OperationKind::TestMode, Session::enable_test_mode)
            .await?;
        Ok(())
    }

    /// Start logging. Frames arrive as [`SessionEvent::Frame`] on [`ProbeClient::subscribe`].
    pub async fn start_logging(&self, bridge_mode: bool) -> Result<(), ClientError> {
        let msg = self.session.lock().start_logging(bridge_mode)?;
        self.send_raw(&msg.encode()).await
    }

    /// Stop the current probe action and wait for the ACK
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.run(OperationKind::Stop, Session::stop).await?;
        Ok(())
    }

    /// Reset the probe link; [`ProbeClient::connect`] again afterwards
    pub async fn reset(&self) -> Result<(), ClientError> {
        let msg = self.session.lock().reset()?;
        self.send_raw(&msg.encode()).await
    }

    // =========================================================================
    // UDS
    // =========================================================================

    /// Open a UDS session. Returns the granted level or the refusing response.
    pub async fn start_uds_session(&self, params: &StartSession) -> Result<Result<u8, UdsResponse>, ClientError> {
        match self
            .run(OperationKind::UdsStart, |s| s.start_uds_session(params))
            .await?
        {
            SessionEvent::UdsSessionEstablished { level } => Ok(Ok(level)),
            SessionEvent::UdsSessionFailed(response) => Ok(Err(response)),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn uds_request(&self, service_id: u8, payload: &[u8]) -> Result<UdsResponse, ClientError> {
        match self
            .run(OperationKind::UdsRequest, |s| s.uds_request(service_id, payload))
            .await?
        {
            SessionEvent::UdsResponse(response) => Ok(response),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn uds_function(&self, function_id: u8) -> Result<(), ClientError> {
        self.run(OperationKind::FunctionCall, |s| s.uds_function(function_id))
            .await?;
        Ok(())
    }

    pub async fn tp_function(&self, function_id: u8) -> Result<(), ClientError> {
        self.run(OperationKind::FunctionCall, |s| s.tp_function(function_id))
            .await?;
        Ok(())
    }

    pub async fn start_tp(&self, module_id: u32, channel_negotiation_id: u32) -> Result<(), ClientError> {
        self.run(OperationKind::TpStart, |s| {
            s.start_tp(module_id, channel_negotiation_id)
        })
        .await?;
        Ok(())
    }

    pub async fn hijack(&self, params: &SecurityHijack) -> Result<HijackResponse, ClientError> {
        match self.run(OperationKind::Hijack, |s| s.hijack(params)).await? {
            SessionEvent::HijackCompleted(response) => Ok(response),
            _ => Err(ClientError::Closed),
        }
    }

    // =========================================================================
    // SD card
    // =========================================================================

    /// Upload `data` to `dir/name`; returns the number of chunks sent
    pub async fn upload(&self, dir: &str, name: &str, data: Bytes) -> Result<u32, ClientError> {
        match self
            .run(OperationKind::Upload, |s| s.upload(dir, name, data))
            .await?
        {
            SessionEvent::UploadComplete { packets, .. } => Ok(packets),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn download(&self, path: &str) -> Result<Bytes, ClientError> {
        match self.run(OperationKind::Download, |s| s.download(path)).await? {
            SessionEvent::DownloadComplete { data, .. } => Ok(data),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn list_directory(&self) -> Result<Vec<DirEntry>, ClientError> {
        match self
            .run(OperationKind::Listing, Session::list_directory)
            .await?
        {
            SessionEvent::DirectoryListed(entries) => Ok(entries),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), ClientError> {
        self.run(OperationKind::Delete, |s| s.delete_file(path))
            .await?;
        Ok(())
    }

    // =========================================================================
    // MITM and replay
    // =========================================================================

    /// Push rules and enable MITM mode; returns the number of rules active
    pub async fn push_rules(&self, rules: &[MitmRule]) -> Result<usize, ClientError> {
        match self.run(OperationKind::RulePush, |s| s.push_rules(rules)).await? {
            SessionEvent::RulesActive { rules } => Ok(rules),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn start_mitm_from_file(&self, file_name: &str) -> Result<(), ClientError> {
        self.run(OperationKind::MitmFromFile, |s| {
            s.start_mitm_from_file(file_name)
        })
        .await?;
        Ok(())
    }

    /// Replay the queue; returns the number of frames sent
    pub async fn replay(&self, queue: ReplayQueue) -> Result<u64, ClientError> {
        match self
            .run(OperationKind::Replay, |s| s.start_replay(queue))
            .await?
        {
            SessionEvent::ReplayComplete { sent } => Ok(sent),
            _ => Err(ClientError::Closed),
        }
    }

    pub async fn set_gpio(&self, gpio: Gpio, high: bool) -> Result<(), ClientError> {
        self.run(OperationKind::Gpio, |s| s.set_gpio(gpio, high))
            .await?;
        Ok(())
    }

    /// Query the relay outputs. Returns the raw state bytes the probe
    /// reported, one per GPIO, or `None` if it only acknowledged.
    pub async fn query_gpio(&self) -> Result<Option<Bytes>, ClientError> {
        // the state arrives as DATA ahead of the ACK
        let mut rx = self.events.subscribe();
        self.run(OperationKind::Gpio, Session::query_gpio).await?;
        let mut state = None;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Data {
                action: ActionKind::Relay,
                payload,
            } = event
            {
                state = Some(payload);
            }
        }
        Ok(state)
    }
}

impl Drop for ProbeClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}
