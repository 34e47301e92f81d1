//! Session state machine

use bytes::Bytes;
use canbadger_proto::commands::{self, Gpio};
use canbadger_proto::mitm::{self, PushStep, RulePush};
use canbadger_proto::settings;
use canbadger_proto::transfer::{self, DirectoryListing, Download, Upload, UploadStep};
use canbadger_proto::uds::{self, HijackResponse, SecurityHijack, StartSession, UdsError};
use canbadger_proto::{
    connect_datagram, ActionKind, CanFrame, Message, MessageKind, MitmRule, ProbeSettings,
    ReplayQueue, ReplayStep,
};
use tracing::{debug, info, trace, warn};

use super::{LinkState, Operation, OperationKind, UdsLink};
use crate::config::{ReplayPolicy, SessionOptions};
use crate::error::SessionError;
use crate::event::SessionEvent;

/// Datagram the session wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Connect { reply_port: u16 },
    Message(Message),
}

impl Outgoing {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Connect { reply_port } => connect_datagram(*reply_port),
            Self::Message(msg) => msg.encode(),
        }
    }

    /// The envelope, unless this is a CONNECT datagram
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Message(msg) => Some(msg),
            Self::Connect { .. } => None,
        }
    }
}

impl From<Message> for Outgoing {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}

/// What handling one incoming datagram produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reaction {
    pub events: Vec<SessionEvent>,
    pub outbound: Vec<Outgoing>,
}

impl Reaction {
    fn event(event: SessionEvent) -> Self {
        Self {
            events: vec![event],
            outbound: Vec::new(),
        }
    }

    fn send(mut self, msg: impl Into<Outgoing>) -> Self {
        self.outbound.push(msg.into());
        self
    }
}

/// Protocol state for one probe link
#[derive(Debug)]
pub struct Session {
    reply_port: u16,
    options: SessionOptions,
    replay_policy: ReplayPolicy,
    state: LinkState,
    pending: Option<Operation>,
    test_mode: bool,
    uds: UdsLink,
    frame_counter: u64,
}

impl Session {
    pub fn new(reply_port: u16, options: SessionOptions, replay_policy: ReplayPolicy) -> Self {
        Self {
            reply_port,
            options,
            replay_policy,
            state: LinkState::Unconnected,
            pending: None,
            test_mode: false,
            uds: UdsLink::Disconnected,
            frame_counter: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Kind of the operation in flight, if any
    pub fn pending(&self) -> Option<OperationKind> {
        self.pending.as_ref().map(Operation::kind)
    }

    pub fn uds_link(&self) -> UdsLink {
        self.uds
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn reply_port(&self) -> u16 {
        self.reply_port
    }

    /// Start (or restart) the connect handshake
    pub fn connect(&mut self) -> Outgoing {
        self.state = LinkState::Unconnected;
        self.pending = None;
        self.test_mode = false;
        self.uds = UdsLink::Disconnected;
        Outgoing::Connect {
            reply_port: self.reply_port,
        }
    }

    // =========================================================================
    // Incoming
    // =========================================================================

    /// Decode and dispatch one datagram from the probe
    pub fn handle_datagram(&mut self, raw: &[u8]) -> Result<Reaction, SessionError> {
        let msg = Message::decode(raw, true)?;
        self.handle_message(msg)
    }

    pub fn handle_message(&mut self, msg: Message) -> Result<Reaction, SessionError> {
        trace!(kind = %msg.kind, action = %msg.action, len = msg.payload.len(), "Incoming message");

        match self.state {
            LinkState::Unconnected => return Ok(self.on_unconnected(&msg)),
            LinkState::Terminated => {
                debug!(kind = %msg.kind, "Ignoring message after termination");
                return Ok(Reaction::default());
            }
            _ => {}
        }

        match msg.kind {
            MessageKind::Data => self.on_data(msg),
            MessageKind::Debug => Ok(Reaction::event(SessionEvent::DebugText(
                String::from_utf8_lossy(&msg.payload).into_owned(),
            ))),
            MessageKind::Ack => Ok(self.on_ack()),
            MessageKind::Nack => Ok(self.on_nack()),
            MessageKind::Action | MessageKind::Connect => Err(SessionError::UnhandledMessage {
                kind: msg.kind,
                action: msg.action,
            }),
        }
    }

    fn on_unconnected(&mut self, msg: &Message) -> Reaction {
        match msg.kind {
            MessageKind::Ack | MessageKind::Debug => {
                info!(reply_port = self.reply_port, "Probe connected");
                self.state = LinkState::Connected;
                let reaction = Reaction::event(SessionEvent::Connected);
                if self.options.request_settings_on_connect {
                    reaction.send(settings::request_settings())
                } else {
                    reaction
                }
            }
            _ => {
                debug!(kind = %msg.kind, "Reply before connect, retrying");
                Reaction::event(SessionEvent::ConnectRetry).send(Outgoing::Connect {
                    reply_port: self.reply_port,
                })
            }
        }
    }

    fn on_data(&mut self, msg: Message) -> Result<Reaction, SessionError> {
        if msg.action == ActionKind::Settings {
            let settings = ProbeSettings::parse(&msg.payload)?;
            debug!(id = %settings.id, "Settings received");
            return Ok(Reaction::event(SessionEvent::SettingsReceived(settings)));
        }
        if self.test_mode {
            return Ok(Reaction::event(SessionEvent::TestData(msg.payload)));
        }
        if self.pending.as_ref().is_some_and(Operation::awaits_data)
            || matches!(self.pending, Some(Operation::Download(_)))
        {
            return self.on_owned_data(&msg.payload);
        }
        if matches!(self.state, LinkState::Logging | LinkState::Stopping) {
            let mut frame = CanFrame::decode_from_probe(&msg.payload)?;
            frame.set_counter(self.frame_counter);
            self.frame_counter += 1;
            return Ok(Reaction::event(SessionEvent::Frame(frame)));
        }
        Ok(Reaction::event(SessionEvent::Data {
            action: msg.action,
            payload: msg.payload,
        }))
    }

    fn on_owned_data(&mut self, payload: &Bytes) -> Result<Reaction, SessionError> {
        let Some(op) = self.pending.take() else {
            return Ok(Reaction::default());
        };

        match op {
            Operation::UdsStart => {
                let response = match uds::parse_response(payload) {
                    Ok(response) => response,
                    Err(e) => {
                        self.uds = UdsLink::Disconnected;
                        return Err(e.into());
                    }
                };
                match response.granted_session_level() {
                    Some(level) => {
                        info!(level, "UDS session established");
                        self.uds = UdsLink::Connected { level };
                        Ok(Reaction::event(SessionEvent::UdsSessionEstablished { level }))
                    }
                    None => {
                        warn!("UDS session start refused");
                        self.uds = UdsLink::Disconnected;
                        Ok(Reaction::event(SessionEvent::UdsSessionFailed(response)))
                    }
                }
            }
            Operation::UdsRequest => {
                let response = uds::parse_response(payload)?;
                Ok(Reaction::event(SessionEvent::UdsResponse(response)))
            }
            Operation::Hijack => {
                let response = HijackResponse::parse(payload)?;
                if response.success {
                    let level = u8::try_from(response.session_level).map_err(|_| {
                        UdsError::InvalidResponse(format!(
                            "hijack session level 0x{:04X} out of range",
                            response.session_level
                        ))
                    })?;
                    self.uds = UdsLink::Connected { level };
                }
                Ok(Reaction::event(SessionEvent::HijackCompleted(response)))
            }
            Operation::Download(mut download) => {
                download.on_data(payload);
                trace!(received = download.received(), "Download chunk");
                let progress = SessionEvent::TransferProgress {
                    operation: OperationKind::Download,
                    bytes: download.received(),
                    total: None,
                };
                self.pending = Some(Operation::Download(download));
                Ok(Reaction::event(progress))
            }
            Operation::Listing(mut listing) => {
                if listing.on_data(payload)? {
                    let entries = listing.into_entries();
                    debug!(entries = entries.len(), "Directory listing complete");
                    Ok(Reaction::event(SessionEvent::DirectoryListed(entries)))
                } else {
                    self.pending = Some(Operation::Listing(listing));
                    Ok(Reaction::default())
                }
            }
            other => {
                self.pending = Some(other);
                Ok(Reaction::default())
            }
        }
    }

    fn on_ack(&mut self) -> Reaction {
        let Some(op) = self.pending.take() else {
            return Reaction::event(SessionEvent::Ack);
        };
        let kind = op.kind();

        match op {
            Operation::TestMode => {
                self.test_mode = true;
                Reaction::event(SessionEvent::Completed(kind))
            }
            Operation::SettingsUpdate
            | Operation::EepromSave
            | Operation::TpStart
            | Operation::FunctionCall { .. }
            | Operation::MitmFromFile
            | Operation::Gpio => Reaction::event(SessionEvent::Completed(kind)),
            Operation::Stop => {
                self.uds = UdsLink::Disconnected;
                if self.state == LinkState::Stopping {
                    info!(frames = self.frame_counter, "Logging stopped");
                    self.state = LinkState::Terminated;
                    Reaction::event(SessionEvent::LoggingStopped)
                } else {
                    Reaction::event(SessionEvent::ActionStopped)
                }
            }
            Operation::Delete { path } => Reaction::event(SessionEvent::FileDeleted { path }),
            Operation::Upload(mut upload) => match upload.on_ack() {
                UploadStep::Send(msg) => {
                    let progress = SessionEvent::TransferProgress {
                        operation: kind,
                        bytes: upload.bytes_sent(),
                        total: Some(upload.total_bytes()),
                    };
                    self.pending = Some(Operation::Upload(upload));
                    Reaction::event(progress).send(msg)
                }
                UploadStep::Complete => {
                    info!(path = upload.path(), packets = upload.packets_sent(), "Upload complete");
                    Reaction::event(SessionEvent::UploadComplete {
                        path: upload.path().to_string(),
                        packets: upload.packets_sent(),
                    })
                }
            },
            Operation::Download(download) => {
                info!(path = download.path(), bytes = download.received(), "Download complete");
                Reaction::event(SessionEvent::DownloadComplete {
                    path: download.path().to_string(),
                    data: download.finish(),
                })
            }
            Operation::RulePush(mut push) => match push.on_ack() {
                PushStep::Send(msg) => {
                    self.pending = Some(Operation::RulePush(push));
                    Reaction::default().send(msg)
                }
                PushStep::Complete => {
                    info!(rules = push.total(), "MITM rules active");
                    Reaction::event(SessionEvent::RulesActive {
                        rules: push.total(),
                    })
                }
            },
            Operation::Replay { queue, sent } => self.advance_replay(queue, sent),
            waiting @ (Operation::UdsStart
            | Operation::UdsRequest
            | Operation::Hijack
            | Operation::Listing(_)) => {
                self.pending = Some(waiting);
                Reaction::event(SessionEvent::Ack)
            }
        }
    }

    fn on_nack(&mut self) -> Reaction {
        let Some(op) = self.pending.take() else {
            return Reaction::event(SessionEvent::Nack);
        };

        if let Operation::Replay { queue, sent } = op {
            if self.replay_policy.advance_on_nack {
                debug!(sent, "Replay frame rejected, advancing");
                return self.advance_replay(queue, sent);
            }
            return self.fail(OperationKind::Replay, SessionError::ProtocolNack {
                action: ActionKind::StartReplay,
            });
        }

        let kind = op.kind();
        let error = match op {
            Operation::Upload(_) | Operation::Download(_) | Operation::RulePush(_) => {
                SessionError::TransferAborted { operation: kind }
            }
            _ => SessionError::ProtocolNack {
                action: op.action(),
            },
        };

        match op {
            Operation::UdsStart => self.uds = UdsLink::Disconnected,
            Operation::Stop if self.state == LinkState::Stopping => {
                self.state = LinkState::Logging;
            }
            _ => {}
        }

        let reaction = self.fail(kind, error);
        if kind == OperationKind::RulePush {
            reaction.send(commands::stop_current_action())
        } else {
            reaction
        }
    }

    fn fail(&mut self, op: OperationKind, error: SessionError) -> Reaction {
        warn!(%op, %error, "Operation failed");
        Reaction::event(SessionEvent::OperationFailed { op, error })
    }

    fn advance_replay(&mut self, mut queue: ReplayQueue, sent: u64) -> Reaction {
        match queue.advance() {
            ReplayStep::Send(msg) => {
                self.pending = Some(Operation::Replay {
                    queue,
                    sent: sent + 1,
                });
                Reaction::default().send(msg)
            }
            ReplayStep::Complete => {
                info!(sent, "Replay complete");
                Reaction::event(SessionEvent::ReplayComplete { sent })
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state {
            LinkState::Connected => {}
            LinkState::Unconnected | LinkState::Terminated => {
                return Err(SessionError::NotConnected)
            }
            LinkState::Logging | LinkState::Stopping => {
                return Err(SessionError::Busy(format!("probe is {}", self.state)))
            }
        }
        match &self.pending {
            Some(op) => Err(SessionError::Busy(format!("{} in flight", op.kind()))),
            None => Ok(()),
        }
    }

    fn begin(&mut self, op: Operation, msg: Message) -> Result<Message, SessionError> {
        self.ensure_ready()?;
        debug!(op = %op.kind(), action = %msg.action, len = msg.payload.len(), "Starting operation");
        self.pending = Some(op);
        Ok(msg)
    }

    /// Drop the in-flight operation without telling the probe
    pub fn abort(&mut self) -> Option<OperationKind> {
        let op = self.pending.take()?;
        if matches!(op, Operation::UdsStart) {
            self.uds = UdsLink::Disconnected;
        }
        if matches!(op, Operation::Stop) && self.state == LinkState::Stopping {
            self.state = LinkState::Logging;
        }
        Some(op.kind())
    }

    /// Ask for the settings blob. Not exclusive; the reply is routed by action.
    pub fn request_settings(&self) -> Result<Message, SessionError> {
        match self.state {
            LinkState::Unconnected | LinkState::Terminated => Err(SessionError::NotConnected),
            _ => Ok(settings::request_settings()),
        }
    }

    pub fn update_settings(&mut self, settings: &ProbeSettings) -> Result<Message, SessionError> {
        let msg = settings.to_update()?;
        self.begin(Operation::SettingsUpdate, msg)
    }

    /// Update one setting as `key;value`
    pub fn update_setting(&mut self, key: &str, value: &str) -> Result<Message, SessionError> {
        let msg = settings::update_setting(key, value)?;
        self.begin(Operation::SettingsUpdate, msg)
    }

    pub fn save_settings(&mut self, file_name: Option<&str>) -> Result<Message, SessionError> {
        self.begin(Operation::EepromSave, settings::save_settings(file_name))
    }

    pub fn enable_test_mode(&mut self) -> Result<Message, SessionError> {
        self.begin(Operation::TestMode, commands::enable_test_mode())
    }

    /// Start streaming CAN frames
    pub fn start_logging(&mut self, bridge_mode: bool) -> Result<Message, SessionError> {
        self.ensure_ready()?;
        info!(bridge_mode, "Starting CAN logging");
        self.state = LinkState::Logging;
        self.frame_counter = 0;
        Ok(commands::start_logging(bridge_mode))
    }

    /// `STOP_CURRENT_ACTION`. While logging this moves to `Stopping`.
    pub fn stop(&mut self) -> Result<Message, SessionError> {
        let msg = commands::stop_current_action();
        match self.state {
            LinkState::Logging => {
                if let Some(op) = &self.pending {
                    return Err(SessionError::Busy(format!("{} in flight", op.kind())));
                }
                self.state = LinkState::Stopping;
                self.pending = Some(Operation::Stop);
                Ok(msg)
            }
            _ => self.begin(Operation::Stop, msg),
        }
    }

    /// `RESET`; the session returns to `Unconnected`
    pub fn reset(&mut self) -> Result<Message, SessionError> {
        if matches!(self.state, LinkState::Unconnected | LinkState::Terminated) {
            return Err(SessionError::NotConnected);
        }
        info!("Resetting probe connection");
        self.state = LinkState::Unconnected;
        self.pending = None;
        self.test_mode = false;
        self.uds = UdsLink::Disconnected;
        Ok(commands::reset())
    }

    pub fn start_uds_session(&mut self, params: &StartSession) -> Result<Message, SessionError> {
        let msg = self.begin(Operation::UdsStart, uds::build_start_session(params))?;
        self.uds = UdsLink::Connecting;
        Ok(msg)
    }

    pub fn uds_request(&mut self, service_id: u8, payload: &[u8]) -> Result<Message, SessionError> {
        self.begin(Operation::UdsRequest, uds::build_request(service_id, payload)?)
    }

    /// Call a probe-side UDS routine by id
    pub fn uds_function(&mut self, function_id: u8) -> Result<Message, SessionError> {
        self.begin(
            Operation::FunctionCall {
                action: ActionKind::Uds,
            },
            uds::uds_function(function_id),
        )
    }

    /// Call a probe-side TP routine by id
    pub fn tp_function(&mut self, function_id: u8) -> Result<Message, SessionError> {
        self.begin(
            Operation::FunctionCall {
                action: ActionKind::Tp,
            },
            uds::tp_function(function_id),
        )
    }

    pub fn start_tp(&mut self, module_id: u32, channel_negotiation_id: u32) -> Result<Message, SessionError> {
        self.begin(
            Operation::TpStart,
            uds::build_start_tp(module_id, channel_negotiation_id),
        )
    }

    pub fn hijack(&mut self, params: &SecurityHijack) -> Result<Message, SessionError> {
        self.begin(Operation::Hijack, params.to_message())
    }

    pub fn upload(&mut self, dir: &str, name: &str, data: Bytes) -> Result<Message, SessionError> {
        self.ensure_ready()?;
        let (upload, open) = Upload::start(dir, name, data)?;
        self.begin(Operation::Upload(upload), open)
    }

    pub fn download(&mut self, path: &str) -> Result<Message, SessionError> {
        self.ensure_ready()?;
        let (download, request) = Download::start(path)?;
        self.begin(Operation::Download(download), request)
    }

    pub fn list_directory(&mut self) -> Result<Message, SessionError> {
        let (listing, request) = DirectoryListing::start();
        self.begin(Operation::Listing(listing), request)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<Message, SessionError> {
        let msg = transfer::delete_file(path)?;
        self.begin(
            Operation::Delete {
                path: path.to_string(),
            },
            msg,
        )
    }

    /// Push `rules` into probe memory and enable MITM mode
    pub fn push_rules(&mut self, rules: &[MitmRule]) -> Result<Message, SessionError> {
        let (push, open) = RulePush::start(rules);
        self.begin(Operation::RulePush(push), open)
    }

    /// Enable MITM mode from a rule file stored under `/MITM`
    pub fn start_mitm_from_file(&mut self, file_name: &str) -> Result<Message, SessionError> {
        let name = mitm::rule_file_name(file_name);
        self.begin(Operation::MitmFromFile, mitm::start_from_file(&name))
    }

    /// Start replaying `queue`. An empty queue is rejected as there is nothing to send.
    pub fn start_replay(&mut self, mut queue: ReplayQueue) -> Result<Message, SessionError> {
        self.ensure_ready()?;
        match queue.advance() {
            ReplayStep::Send(msg) => {
                info!(remaining = queue.remaining_sends() + 1, "Starting replay");
                self.begin(Operation::Replay { queue, sent: 1 }, msg)
            }
            ReplayStep::Complete => Err(SessionError::EmptyReplay),
        }
    }

    pub fn set_gpio(&mut self, gpio: Gpio, high: bool) -> Result<Message, SessionError> {
        self.begin(Operation::Gpio, commands::set_gpio(gpio, high))
    }

    pub fn query_gpio(&mut self) -> Result<Message, SessionError> {
        self.begin(Operation::Gpio, commands::query_gpio())
    }
}
