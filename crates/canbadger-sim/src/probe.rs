//! Simulated probe state
//!
//! Pure request handling: one incoming envelope in, the replies out. The
//! socket loop in [`crate::server`] owns the timing.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use canbadger_proto::mitm::{self, MitmRule, MITM_DIRECTORY};
use canbadger_proto::transfer::{encode_listing_batch, join_path, EntryKind, UPLOAD_CHUNK_SIZE};
use canbadger_proto::uds::{
    service_id, HijackResponse, NegativeResponseCode, StartSession, UdsResponse,
    POSITIVE_RESPONSE_OFFSET,
};
use canbadger_proto::{
    ActionKind, CanFormat, CanFrame, Interface, Message, MessageKind, ProbeSettings, StatusBit,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SimConfig;

/// Function ids below this are built-in probe routines, not UDS services
const MAX_FUNCTION_ID: u8 = 0x10;

#[derive(Debug)]
struct OpenUpload {
    path: String,
    data: Vec<u8>,
    next_packet: u32,
}

pub struct SimulatedProbe {
    config: SimConfig,
    settings: ProbeSettings,
    sd: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
    upload: Option<OpenUpload>,
    logging: Option<bool>,
    receiving_rules: bool,
    rule_buffer: Vec<MitmRule>,
    active_rules: Vec<MitmRule>,
    mitm_enabled: bool,
    relays: [bool; 2],
    test_mode: bool,
    uds_session: Option<u8>,
    replayed: Vec<Bytes>,
    eeprom_writes: u32,
    started: Instant,
}

impl SimulatedProbe {
    pub fn new(config: SimConfig) -> Self {
        let settings = config.initial_settings();
        let mut probe = Self {
            settings,
            sd: BTreeMap::new(),
            directories: BTreeSet::from(["/".to_string(), MITM_DIRECTORY.to_string()]),
            upload: None,
            logging: None,
            receiving_rules: false,
            rule_buffer: Vec::new(),
            active_rules: Vec::new(),
            mitm_enabled: false,
            relays: [false; 2],
            test_mode: false,
            uds_session: None,
            replayed: Vec::new(),
            eeprom_writes: 0,
            started: Instant::now(),
            config,
        };
        for file in probe.config.sd_files.clone() {
            probe.store(&file.path, file.content.into_bytes());
        }
        probe
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.sd.get(path).map(Vec::as_slice)
    }

    pub fn active_rules(&self) -> &[MitmRule] {
        &self.active_rules
    }

    pub fn is_mitm_enabled(&self) -> bool {
        self.mitm_enabled
    }

    pub fn relays(&self) -> [bool; 2] {
        self.relays
    }

    pub fn replayed(&self) -> &[Bytes] {
        &self.replayed
    }

    pub fn is_logging(&self) -> bool {
        self.logging.is_some()
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn eeprom_writes(&self) -> u32 {
        self.eeprom_writes
    }

    fn store(&mut self, path: &str, data: Vec<u8>) {
        let mut dir = path;
        while let Some(idx) = dir.rfind('/') {
            dir = &dir[..idx];
            self.directories.insert(if dir.is_empty() { "/".to_string() } else { dir.to_string() });
        }
        self.sd.insert(path.to_string(), data);
    }

    /// Drop volatile state after a RESET
    pub fn reset(&mut self) {
        self.upload = None;
        self.logging = None;
        self.receiving_rules = false;
        self.test_mode = false;
        self.uds_session = None;
    }

    /// Handle one envelope from the client
    pub fn handle(&mut self, msg: &Message) -> Vec<Message> {
        if msg.kind != MessageKind::Action {
            debug!(kind = %msg.kind, "Ignoring non-action message");
            return Vec::new();
        }
        debug!(action = %msg.action, len = msg.payload.len(), "Action received");

        match msg.action {
            ActionKind::Settings => self.on_settings(&msg.payload),
            ActionKind::EepromWrite => {
                self.eeprom_writes += 1;
                vec![Message::ack()]
            }
            ActionKind::LogRawCanTraffic => {
                let bridge = msg.payload.first().is_some_and(|b| *b != 0);
                info!(bridge, "Logging started");
                self.logging = Some(bridge);
                Vec::new()
            }
            ActionKind::EnableTestMode => {
                self.test_mode = true;
                vec![Message::ack()]
            }
            ActionKind::StopCurrentAction => self.on_stop(),
            ActionKind::Reset => {
                info!("Reset requested");
                self.reset();
                Vec::new()
            }
            ActionKind::StartUds => self.on_start_uds(&msg.payload),
            ActionKind::Uds => self.on_uds(&msg.payload),
            ActionKind::StartTp | ActionKind::Tp | ActionKind::Led => vec![Message::ack()],
            ActionKind::UdsHijack => self.on_hijack(&msg.payload),
            ActionKind::UpdateSd => self.on_update_sd(&msg.payload),
            ActionKind::DownloadFile => self.on_download(&msg.payload),
            ActionKind::DeleteFile => {
                let path = nul_trimmed(&msg.payload);
                match self.sd.remove(&path) {
                    Some(_) => vec![Message::ack()],
                    None => vec![Message::nack()],
                }
            }
            ActionKind::ReceiveRules => {
                self.receiving_rules = true;
                self.rule_buffer.clear();
                vec![Message::ack()]
            }
            ActionKind::AddRule => self.on_add_rule(&msg.payload),
            ActionKind::Mitm => {
                self.receiving_rules = false;
                self.active_rules = std::mem::take(&mut self.rule_buffer);
                self.mitm_enabled = true;
                info!(rules = self.active_rules.len(), "MITM enabled");
                vec![Message::ack()]
            }
            ActionKind::EnableMitmMode => self.on_mitm_from_file(&msg.payload),
            ActionKind::StartReplay => {
                if msg.payload.is_empty() {
                    return vec![Message::nack()];
                }
                self.replayed.push(msg.payload.clone());
                vec![Message::ack()]
            }
            ActionKind::Relay => self.on_relay(&msg.payload),
            ActionKind::NoType => vec![Message::nack()],
        }
    }

    fn on_settings(&mut self, payload: &[u8]) -> Vec<Message> {
        if payload.is_empty() {
            return match self.settings.encode() {
                Ok(blob) => vec![Message::data(ActionKind::Settings, blob)],
                Err(e) => {
                    warn!(error = %e, "Cannot encode settings");
                    vec![Message::nack()]
                }
            };
        }
        if let Ok(settings) = ProbeSettings::parse(payload) {
            info!(id = %settings.id, "Settings replaced");
            self.settings = settings;
            return vec![Message::ack()];
        }
        match self.apply_setting(payload) {
            Ok(()) => vec![Message::ack()],
            Err(reason) => {
                warn!(%reason, "Rejected setting");
                vec![Message::nack()]
            }
        }
    }

    /// Apply a `key;value` update
    fn apply_setting(&mut self, payload: &[u8]) -> Result<(), String> {
        let text = std::str::from_utf8(payload).map_err(|e| e.to_string())?;
        let (key, value) = text.split_once(';').ok_or("missing ';'")?;
        let number = || -> Result<u32, String> {
            value.trim().parse::<u32>().map_err(|e| format!("{key}: {e}"))
        };
        match key {
            "id" => {
                if value.len() > canbadger_proto::settings::MAX_ID_LEN {
                    return Err("id too long".to_string());
                }
                self.settings.id = value.to_string();
            }
            "ip" => self.settings.ip = value.as_bytes().to_vec(),
            "spi_speed" => self.settings.spi_speed = number()?,
            "can1_speed" => self.settings.can1_speed = number()?,
            "can2_speed" => self.settings.can2_speed = number()?,
            "kline1_speed" => self.settings.kline1_speed = number()?,
            "kline2_speed" => self.settings.kline2_speed = number()?,
            "status" => self.settings.status.0 = number()?,
            other => {
                let bit: StatusBit = other.parse().map_err(|_| format!("unknown key '{other}'"))?;
                self.settings.status.set(bit, number()? != 0);
            }
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Vec<Message> {
        if self.logging.take().is_some() {
            info!("Logging stopped");
        }
        if let Some(upload) = self.upload.take() {
            info!(path = %upload.path, bytes = upload.data.len(), packets = upload.next_packet, "Upload stored");
            self.store(&upload.path, upload.data);
        }
        self.receiving_rules = false;
        vec![Message::ack()]
    }

    fn on_update_sd(&mut self, payload: &[u8]) -> Vec<Message> {
        if payload.is_empty() {
            return self.listing();
        }
        let Some(upload) = self.upload.as_mut() else {
            let path = nul_trimmed(payload);
            debug!(%path, "Upload opened");
            self.upload = Some(OpenUpload {
                path,
                data: Vec::new(),
                next_packet: 0,
            });
            return vec![Message::ack()];
        };

        if payload.len() < 5 {
            return vec![Message::nack()];
        }
        let mut header = &payload[..5];
        let packet = header.get_u32_le();
        let len = usize::from(header.get_u8());
        let chunk = &payload[5..];
        if packet != upload.next_packet || len != chunk.len() || len > UPLOAD_CHUNK_SIZE {
            warn!(packet, expected = upload.next_packet, len, "Bad upload chunk");
            return vec![Message::nack()];
        }
        upload.data.extend_from_slice(chunk);
        upload.next_packet += 1;
        vec![Message::ack()]
    }

    fn listing(&self) -> Vec<Message> {
        let mut replies = Vec::new();
        for dir in &self.directories {
            let mut entries: Vec<(EntryKind, String)> = self
                .directories
                .iter()
                .filter(|sub| *sub != dir && parent_of(sub) == dir.as_str())
                .map(|sub| (EntryKind::Directory, file_name(sub).to_string()))
                .collect();
            entries.extend(
                self.sd
                    .keys()
                    .filter(|path| parent_of(path) == dir.as_str())
                    .map(|path| (EntryKind::File, file_name(path).to_string())),
            );
            if entries.is_empty() {
                continue;
            }
            let refs: Vec<(EntryKind, &str)> =
                entries.iter().map(|(kind, name)| (*kind, name.as_str())).collect();
            replies.push(Message::data(
                ActionKind::UpdateSd,
                encode_listing_batch(dir, &refs),
            ));
        }
        replies.push(Message::data(ActionKind::UpdateSd, vec![0u8]));
        replies
    }

    fn on_download(&self, payload: &[u8]) -> Vec<Message> {
        let path = nul_trimmed(payload);
        let Some(data) = self.sd.get(&path) else {
            return vec![Message::nack()];
        };
        let mut replies: Vec<Message> = data
            .chunks(UPLOAD_CHUNK_SIZE)
            .enumerate()
            .map(|(packet, chunk)| {
                let mut buf = BytesMut::with_capacity(6 + chunk.len());
                buf.put_u32_le(packet as u32);
                buf.put_u16_le(chunk.len() as u16);
                buf.put_slice(chunk);
                Message::data(ActionKind::DownloadFile, buf.freeze())
            })
            .collect();
        replies.push(Message::ack());
        replies
    }

    fn on_add_rule(&mut self, payload: &[u8]) -> Vec<Message> {
        if !self.receiving_rules {
            return vec![Message::nack()];
        }
        match MitmRule::decode(&nul_trimmed(payload)) {
            Ok(rule) => {
                self.rule_buffer.push(rule);
                vec![Message::ack()]
            }
            Err(e) => {
                warn!(error = %e, "Rejected rule");
                vec![Message::nack()]
            }
        }
    }

    fn on_mitm_from_file(&mut self, payload: &[u8]) -> Vec<Message> {
        let path = join_path(MITM_DIRECTORY, &nul_trimmed(payload));
        let rules = self
            .sd
            .get(&path)
            .map(|data| mitm::decode_rules(&String::from_utf8_lossy(data)));
        match rules {
            Some(Ok(rules)) => {
                info!(%path, rules = rules.len(), "MITM enabled from file");
                self.active_rules = rules;
                self.mitm_enabled = true;
                vec![Message::ack()]
            }
            _ => vec![Message::nack()],
        }
    }

    fn on_start_uds(&mut self, payload: &[u8]) -> Vec<Message> {
        let Ok(request) = StartSession::decode(payload) else {
            return vec![Message::nack()];
        };
        if !self.config.uds.accept_sessions {
            return vec![Message::nack()];
        }
        let level = request.target_session as u8;
        self.uds_session = Some(level);
        let positive = service_id::DIAGNOSTIC_SESSION_CONTROL + POSITIVE_RESPONSE_OFFSET;
        let response = UdsResponse::positive(
            u16::from(service_id::DIAGNOSTIC_SESSION_CONTROL),
            vec![positive, level],
        );
        vec![Message::data(ActionKind::StartUds, response.encode())]
    }

    fn on_uds(&mut self, payload: &[u8]) -> Vec<Message> {
        let Some((&sid, params)) = payload.split_first() else {
            return vec![Message::nack()];
        };
        if params.is_empty() && sid < MAX_FUNCTION_ID {
            debug!(function = sid, "Probe function called");
            return vec![Message::ack()];
        }

        debug!(sid = format_args!("0x{sid:02X}"), params = %hex::encode(params), "UDS request");
        let response = if self.uds_session.is_none() {
            UdsResponse::negative(u16::from(sid), NegativeResponseCode::ConditionsNotCorrect)
        } else {
            self.answer_uds(sid, params)
        };
        vec![Message::data(ActionKind::Uds, response.encode())]
    }

    fn answer_uds(&self, sid: u8, params: &[u8]) -> UdsResponse {
        let positive = sid.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        match sid {
            service_id::READ_DATA_BY_ID if matches!(params.len(), 1 | 2) => {
                let mut body = vec![positive];
                body.extend_from_slice(params);
                body.extend_from_slice(self.settings.id.as_bytes());
                UdsResponse::positive(u16::from(sid), body)
            }
            service_id::READ_MEMORY_BY_ADDRESS if !params.is_empty() => {
                let format = params[0];
                let addr_len = usize::from(format & 0x0F);
                let size_len = usize::from(format >> 4);
                if params.len() != 1 + addr_len + size_len || size_len > 4 {
                    return UdsResponse::negative(
                        u16::from(sid),
                        NegativeResponseCode::IncorrectMessageLengthOrFormat,
                    );
                }
                let size = params[1 + addr_len..]
                    .iter()
                    .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
                let mut body = vec![positive];
                body.extend((0..size.min(64)).map(|i| i as u8));
                UdsResponse::positive(u16::from(sid), body)
            }
            service_id::TESTER_PRESENT => {
                UdsResponse::positive(u16::from(sid), vec![positive, params.first().copied().unwrap_or(0)])
            }
            _ => UdsResponse::negative(u16::from(sid), NegativeResponseCode::ServiceNotSupported),
        }
    }

    fn on_hijack(&mut self, payload: &[u8]) -> Vec<Message> {
        if payload.len() != 12 {
            return vec![Message::nack()];
        }
        let session_level = u16::from_le_bytes([payload[10], payload[11]]);
        let success = self.config.uds.accept_sessions;
        if success {
            self.uds_session = Some(session_level as u8);
        }
        let response = HijackResponse {
            success,
            session_level,
        };
        vec![Message::data(ActionKind::UdsHijack, response.encode())]
    }

    fn on_relay(&mut self, payload: &[u8]) -> Vec<Message> {
        match payload {
            [] => vec![
                Message::data(
                    ActionKind::Relay,
                    vec![u8::from(self.relays[0]), u8::from(self.relays[1])],
                ),
                Message::ack(),
            ],
            [gpio @ (1 | 2), state @ (0 | 1)] => {
                self.relays[usize::from(*gpio) - 1] = *state == 1;
                vec![Message::ack()]
            }
            _ => vec![Message::nack()],
        }
    }

    /// Next random frame while logging
    pub fn next_log_frame(&mut self, rng: &mut impl Rng) -> Option<Message> {
        let bridge = self.logging?;
        let interface = if bridge && rng.gen_bool(0.5) {
            Interface::Can2
        } else {
            Interface::Can1
        };
        let speed = match interface {
            Interface::Can1 => self.settings.can1_speed,
            Interface::Can2 => self.settings.can2_speed,
        };
        let low = self.config.logging.id_low.min(self.config.logging.id_high);
        let id = rng.gen_range(low..=self.config.logging.id_high);
        let len = rng.gen_range(1..=8);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let timestamp = self.started.elapsed().as_micros() as u32;

        let frame = CanFrame::new(interface, CanFormat::Standard, timestamp, id, speed, len, payload)
            .and_then(|frame| frame.encode_for_probe());
        match frame {
            Ok(block) => Some(Message::data(ActionKind::LogRawCanTraffic, block)),
            Err(e) => {
                warn!(error = %e, "Cannot build log frame");
                None
            }
        }
    }
}

fn nul_trimmed(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .to_string()
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbadger_proto::transfer::{DirectoryListing, Download, Upload, UploadStep};
    use canbadger_proto::{commands, settings as probe_settings, ConditionKind, RuleKind};
    use pretty_assertions::assert_eq;

    fn probe() -> SimulatedProbe {
        SimulatedProbe::new(SimConfig::default())
    }

    #[test]
    fn test_settings_request_and_update() {
        let mut probe = probe();
        let replies = probe.handle(&probe_settings::request_settings());
        assert_eq!(replies.len(), 1);
        let settings = ProbeSettings::parse(&replies[0].payload).unwrap();
        assert_eq!(settings.id, "cb_sim");

        let update = probe_settings::update_setting("can2_speed", "125000").unwrap();
        assert_eq!(probe.handle(&update), vec![Message::ack()]);
        assert_eq!(probe.settings().can2_speed, 125_000);

        let update = probe_settings::update_setting("CAN1_MONITOR", "1").unwrap();
        assert_eq!(probe.handle(&update), vec![Message::ack()]);
        assert!(probe.settings().status.get(StatusBit::Can1Monitor));

        let update = probe_settings::update_setting("bogus", "1").unwrap();
        assert_eq!(probe.handle(&update), vec![Message::nack()]);
    }

    #[test]
    fn test_upload_then_download() {
        let mut probe = probe();
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let (mut upload, open) = Upload::start("/logs", "trace.bin", data.clone()).unwrap();
        assert_eq!(probe.handle(&open), vec![Message::ack()]);
        while let UploadStep::Send(msg) = upload.on_ack() {
            assert_eq!(probe.handle(&msg), vec![Message::ack()]);
        }
        assert_eq!(probe.file("/logs/trace.bin"), Some(data.as_slice()));

        let (mut download, request) = Download::start("/logs/trace.bin").unwrap();
        let replies = probe.handle(&request);
        assert_eq!(replies.last(), Some(&Message::ack()));
        for reply in &replies[..replies.len() - 1] {
            download.on_data(&reply.payload);
        }
        assert_eq!(download.finish().as_ref(), data.as_slice());
    }

    #[test]
    fn test_listing_includes_new_directories() {
        let mut probe = probe();
        probe.store("/logs/a.txt", b"a".to_vec());
        probe.store("/b.txt", b"b".to_vec());

        let (mut listing, request) = DirectoryListing::start();
        let mut ended = false;
        for reply in probe.handle(&request) {
            ended = listing.on_data(&reply.payload).unwrap();
        }
        assert!(ended);
        let mut paths: Vec<String> = listing.entries().iter().map(|e| e.path()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/MITM", "/b.txt", "/logs", "/logs/a.txt"]);
    }

    #[test]
    fn test_rule_push() {
        let mut probe = probe();
        let rule = MitmRule::new(RuleKind::DropFrame, ConditionKind::PayloadMatches)
            .with_target("7f0")
            .unwrap();
        assert_eq!(
            probe.handle(&Message::action(ActionKind::AddRule, b"x\0".to_vec())),
            vec![Message::nack()]
        );
        probe.handle(&Message::command(ActionKind::ReceiveRules));
        let mut line = rule.encode().into_bytes();
        line.push(0);
        assert_eq!(
            probe.handle(&Message::action(ActionKind::AddRule, line)),
            vec![Message::ack()]
        );
        probe.handle(&Message::command(ActionKind::Mitm));
        assert!(probe.is_mitm_enabled());
        assert_eq!(probe.active_rules(), &[rule]);
    }

    #[test]
    fn test_logging_frames_decode() {
        let mut probe = probe();
        let mut rng = rand::thread_rng();
        assert!(probe.next_log_frame(&mut rng).is_none());

        probe.handle(&commands::start_logging(false));
        for _ in 0..50 {
            let msg = probe.next_log_frame(&mut rng).unwrap();
            let frame = CanFrame::decode_from_probe(&msg.payload).unwrap();
            assert!((0x7F0..=0x7FF).contains(&frame.arbitration_id()));
            assert_eq!(frame.interface(), Interface::Can1);
        }

        assert_eq!(probe.handle(&commands::stop_current_action()), vec![Message::ack()]);
        assert!(!probe.is_logging());
    }

    #[test]
    fn test_uds_requires_session() {
        let mut probe = probe();
        let request = canbadger_proto::uds::build_request(0x22, &[0xF1, 0x90]).unwrap();
        let replies = probe.handle(&request);
        let response = canbadger_proto::uds::parse_response(&replies[0].payload).unwrap();
        assert!(!response.is_positive);
    }

    #[test]
    fn test_relay() {
        let mut probe = probe();
        probe.handle(&commands::set_gpio(commands::Gpio::Two, true));
        assert_eq!(probe.relays(), [false, true]);
        let replies = probe.handle(&commands::query_gpio());
        assert_eq!(replies[0].payload.as_ref(), &[0, 1]);
        assert_eq!(
            probe.handle(&Message::action(ActionKind::Relay, vec![3, 1])),
            vec![Message::nack()]
        );
    }
}
