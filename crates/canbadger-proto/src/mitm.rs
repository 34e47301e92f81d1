//! MITM rule model and its text encoding
//!
//! Each rule travels as one comma-separated line of 19 fields:
//!
//! ```text
//! <cmask:2 hex>0<ckind:1 hex>,<target>,c0,c1,..,c7,<amask:2 hex>0<rkind:1 hex>,a0,a1,..,a7
//! ```
//!
//! Masks are bit-reversed relative to their textual form: character `i` of
//! `"10000000"` maps to bit `i` of the mask byte.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::message::{ActionKind, Message};

/// Number of comma-separated fields in one encoded rule
pub const RULE_FIELD_COUNT: usize = 19;

/// Bytes in a condition or action pattern
pub const PATTERN_LEN: usize = 8;

/// SD card directory the probe loads rule files from
pub const MITM_DIRECTORY: &str = "/MITM";

pub const DEFAULT_RULE_FILE: &str = "rules.txt";

/// Longest rule file name the probe firmware accepts
pub const MAX_RULE_FILE_NAME: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MitmError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Malformed rule on line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
}

/// Payload transformation applied to a matching frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    SwapPayload,
    SwapBytes,
    AddToBytes,
    SubtractFromBytes,
    MultiplyBytes,
    DivideBytes,
    IncreaseBytesByPercent,
    DecreaseBytesByPercent,
    DropFrame,
}

impl RuleKind {
    pub const ALL: [RuleKind; 9] = [
        Self::SwapPayload,
        Self::SwapBytes,
        Self::AddToBytes,
        Self::SubtractFromBytes,
        Self::MultiplyBytes,
        Self::DivideBytes,
        Self::IncreaseBytesByPercent,
        Self::DecreaseBytesByPercent,
        Self::DropFrame,
    ];

    /// Position in the probe's rule table
    pub fn index(self) -> u8 {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0) as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Label used by the probe tooling
    pub fn label(self) -> &'static str {
        match self {
            Self::SwapPayload => "Swap Payload",
            Self::SwapBytes => "Swap Specific Bytes",
            Self::AddToBytes => "Add fixed Value to specific bytes",
            Self::SubtractFromBytes => "Substract fixed Value from specific bytes",
            Self::MultiplyBytes => "Multiply specific bytes",
            Self::DivideBytes => "Divide specific bytes",
            Self::IncreaseBytesByPercent => "Increase specific bytes by fixed percentage",
            Self::DecreaseBytesByPercent => "Decrease specific bytes by fixed percentage",
            Self::DropFrame => "Drop Frame",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Match applied to a frame before the rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    PayloadMatches,
    BytesMatch,
    BytesGreater,
    BytesLess,
}

impl ConditionKind {
    pub const ALL: [ConditionKind; 4] = [
        Self::PayloadMatches,
        Self::BytesMatch,
        Self::BytesGreater,
        Self::BytesLess,
    ];

    pub fn index(self) -> u8 {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(0) as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::PayloadMatches => "Entire payload matches",
            Self::BytesMatch => "Specific bytes match",
            Self::BytesGreater => "Specific bytes are greater",
            Self::BytesLess => "Specific bytes are less",
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Selects which of the 8 payload bytes a condition or action touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteMask(u8);

impl ByteMask {
    pub const ALL: ByteMask = ByteMask(0xFF);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_set(self, byte_index: usize) -> bool {
        byte_index < PATTERN_LEN && self.0 & (1 << byte_index) != 0
    }
}

impl FromStr for ByteMask {
    type Err = MitmError;

    /// Parse the 8-character `0`/`1` form, leftmost character first byte
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PATTERN_LEN {
            return Err(MitmError::InvalidRule(format!(
                "mask '{s}' must have {PATTERN_LEN} characters"
            )));
        }
        s.chars().enumerate().try_fold(0u8, |bits, (i, c)| match c {
            '1' => Ok(bits | (1 << i)),
            '0' => Ok(bits),
            other => Err(MitmError::InvalidRule(format!(
                "mask character '{other}' is not 0 or 1"
            ))),
        })
        .map(Self)
    }
}

impl fmt::Display for ByteMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..PATTERN_LEN {
            f.write_str(if self.is_set(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Eight-byte condition or action pattern. Shorter inputs are zero-padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pattern([u8; PATTERN_LEN]);

impl Pattern {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MitmError> {
        if bytes.len() > PATTERN_LEN {
            return Err(MitmError::InvalidRule(format!(
                "pattern of {} bytes exceeds {PATTERN_LEN}",
                bytes.len()
            )));
        }
        let mut pattern = [0u8; PATTERN_LEN];
        pattern[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(pattern))
    }

    pub fn as_bytes(&self) -> &[u8; PATTERN_LEN] {
        &self.0
    }
}

impl FromStr for Pattern {
    type Err = MitmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| MitmError::InvalidRule(format!("pattern '{s}': {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One intercept rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MitmRule {
    pub rule_kind: RuleKind,
    pub condition_kind: ConditionKind,
    target_id: Option<String>,
    pub condition_value: Pattern,
    pub condition_mask: ByteMask,
    pub action_argument: Pattern,
    pub action_mask: ByteMask,
}

impl MitmRule {
    /// Rule matching every frame with empty patterns and masks
    pub fn new(rule_kind: RuleKind, condition_kind: ConditionKind) -> Self {
        Self {
            rule_kind,
            condition_kind,
            target_id: None,
            condition_value: Pattern::default(),
            condition_mask: ByteMask::default(),
            action_argument: Pattern::default(),
            action_mask: ByteMask::default(),
        }
    }

    /// Restrict the rule to one arbitration id, given as hex text.
    /// An empty id or `0` matches any frame.
    pub fn with_target(mut self, target: &str) -> Result<Self, MitmError> {
        self.target_id = normalize_target(target)?;
        Ok(self)
    }

    pub fn with_condition(mut self, value: Pattern, mask: ByteMask) -> Self {
        self.condition_value = value;
        self.condition_mask = mask;
        self
    }

    pub fn with_action(mut self, argument: Pattern, mask: ByteMask) -> Self {
        self.action_argument = argument;
        self.action_mask = mask;
        self
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    /// Encode as a single rule line (no trailing newline)
    pub fn encode(&self) -> String {
        let mut fields = Vec::with_capacity(RULE_FIELD_COUNT);
        fields.push(kind_field(self.condition_mask, self.condition_kind.index()));
        fields.push(self.target_id.clone().unwrap_or_else(|| "0".to_string()));
        fields.extend(self.condition_value.0.iter().map(|b| format!("{b:02x}")));
        fields.push(kind_field(self.action_mask, self.rule_kind.index()));
        fields.extend(self.action_argument.0.iter().map(|b| format!("{b:02x}")));
        fields.join(",")
    }

    /// Decode a single rule line
    pub fn decode(line: &str) -> Result<Self, MitmError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n', '\0']).split(',').collect();
        if fields.len() != RULE_FIELD_COUNT {
            return Err(MitmError::InvalidRule(format!(
                "expected {RULE_FIELD_COUNT} fields, found {}",
                fields.len()
            )));
        }

        let (condition_mask, condition_index) = parse_kind_field(fields[0])?;
        let condition_kind = ConditionKind::from_index(condition_index).ok_or_else(|| {
            MitmError::InvalidRule(format!("condition kind {condition_index} out of range"))
        })?;
        let target_id = normalize_target(fields[1])?;
        let condition_value = parse_pairs(&fields[2..10])?;
        let (action_mask, rule_index) = parse_kind_field(fields[10])?;
        let rule_kind = RuleKind::from_index(rule_index)
            .ok_or_else(|| MitmError::InvalidRule(format!("rule kind {rule_index} out of range")))?;
        let action_argument = parse_pairs(&fields[11..19])?;

        Ok(Self {
            rule_kind,
            condition_kind,
            target_id,
            condition_value,
            condition_mask,
            action_argument,
            action_mask,
        })
    }
}

fn kind_field(mask: ByteMask, kind: u8) -> String {
    format!("{:02x}0{:x}", mask.bits(), kind)
}

fn parse_kind_field(field: &str) -> Result<(ByteMask, u8), MitmError> {
    if field.len() != 4 || !field.is_ascii() {
        return Err(MitmError::InvalidRule(format!(
            "mask/kind field '{field}' must be 4 hex characters"
        )));
    }
    let mask = u8::from_str_radix(&field[..2], 16)
        .map_err(|e| MitmError::InvalidRule(format!("mask '{field}': {e}")))?;
    let kind = u8::from_str_radix(&field[2..], 16)
        .map_err(|e| MitmError::InvalidRule(format!("kind '{field}': {e}")))?;
    Ok((ByteMask(mask), kind))
}

fn parse_pairs(fields: &[&str]) -> Result<Pattern, MitmError> {
    let mut pattern = [0u8; PATTERN_LEN];
    for (slot, field) in pattern.iter_mut().zip(fields) {
        if field.len() != 2 {
            return Err(MitmError::InvalidRule(format!(
                "byte pair '{field}' must be 2 hex characters"
            )));
        }
        *slot = u8::from_str_radix(field, 16)
            .map_err(|e| MitmError::InvalidRule(format!("byte pair '{field}': {e}")))?;
    }
    Ok(Pattern(pattern))
}

fn normalize_target(target: &str) -> Result<Option<String>, MitmError> {
    let trimmed = target.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed == "0" {
        return Ok(None);
    }
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MitmError::InvalidRule(format!(
            "target id '{target}' is not hex"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

/// Encode a rule set as newline-joined lines
pub fn encode_rules(rules: &[MitmRule]) -> String {
    rules
        .iter()
        .map(MitmRule::encode)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode a rule file. Blank lines are skipped; any other malformed line fails.
pub fn decode_rules(text: &str) -> Result<Vec<MitmRule>, MitmError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            MitmRule::decode(line).map_err(|e| MitmError::MalformedLine {
                line: n + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Normalize a rule file name the way the probe expects it: `.txt`
/// extension, at most 16 characters, `rules.txt` when empty.
pub fn rule_file_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return DEFAULT_RULE_FILE.to_string();
    }
    let stem = match name.find('.') {
        Some(dot) => &name[..dot],
        None => name,
    };
    let stem: String = stem.chars().take(MAX_RULE_FILE_NAME - 4).collect();
    if stem.is_empty() {
        return DEFAULT_RULE_FILE.to_string();
    }
    format!("{stem}.txt")
}

/// Action starting MITM mode from a rule file already on the SD card
pub fn start_from_file(file_name: &str) -> Message {
    let mut buf = BytesMut::with_capacity(file_name.len() + 1);
    buf.put_slice(file_name.as_bytes());
    buf.put_u8(0);
    Message::action(ActionKind::EnableMitmMode, buf.freeze())
}

/// Next step of a rule push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStep {
    /// Send this message and wait for its ACK
    Send(Message),
    /// The probe acknowledged the enable command
    Complete,
}

/// Sequential rule upload straight into probe memory.
///
/// `RECEIVE_RULES` opens the exchange. Each ACK releases the next rule, the
/// ACK after the last rule releases the MITM enable command, and the ACK to
/// that finishes the push.
#[derive(Debug, Clone)]
pub struct RulePush {
    lines: Vec<String>,
    next: usize,
    enabling: bool,
}

impl RulePush {
    /// Start a push. Returns the driver and the opening `RECEIVE_RULES` command.
    pub fn start(rules: &[MitmRule]) -> (Self, Message) {
        let lines = rules.iter().map(MitmRule::encode).collect();
        (
            Self {
                lines,
                next: 0,
                enabling: false,
            },
            Message::command(ActionKind::ReceiveRules),
        )
    }

    /// React to an ACK from the probe
    pub fn on_ack(&mut self) -> PushStep {
        if self.enabling {
            return PushStep::Complete;
        }
        match self.lines.get(self.next) {
            Some(line) => {
                self.next += 1;
                debug!(rule = self.next, total = self.lines.len(), "Sending MITM rule");
                let mut buf = BytesMut::with_capacity(line.len() + 1);
                buf.put_slice(line.as_bytes());
                buf.put_u8(0);
                PushStep::Send(Message::action(ActionKind::AddRule, buf.freeze()))
            }
            None => {
                self.enabling = true;
                PushStep::Send(Message::command(ActionKind::Mitm))
            }
        }
    }

    pub fn sent(&self) -> usize {
        self.next
    }

    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Whether the enable command has gone out
    pub fn is_enabling(&self) -> bool {
        self.enabling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mask(s: &str) -> ByteMask {
        s.parse().unwrap()
    }

    fn pattern(s: &str) -> Pattern {
        s.parse().unwrap()
    }

    fn sample_rule() -> MitmRule {
        MitmRule::new(RuleKind::AddToBytes, ConditionKind::BytesMatch)
            .with_target("7E0")
            .unwrap()
            .with_condition(pattern("0210"), mask("11000000"))
            .with_action(pattern("0000000000000001"), mask("00000001"))
    }

    #[test]
    fn test_mask_is_bit_reversed() {
        assert_eq!(mask("10000000").bits(), 0x01);
        assert_eq!(mask("00000001").bits(), 0x80);
        assert_eq!(mask("11000000").bits(), 0x03);
        assert_eq!(mask("11000000").to_string(), "11000000");
        assert!("1100".parse::<ByteMask>().is_err());
        assert!("1100000x".parse::<ByteMask>().is_err());
    }

    #[test]
    fn test_encode_line_layout() {
        assert_eq!(
            sample_rule().encode(),
            "0301,7E0,02,10,00,00,00,00,00,00,8002,00,00,00,00,00,00,00,01"
        );
    }

    #[test]
    fn test_empty_target_encodes_as_zero() {
        let rule = MitmRule::new(RuleKind::DropFrame, ConditionKind::PayloadMatches);
        let line = rule.encode();
        assert!(line.starts_with("0000,0,"));
        assert_eq!(line.split(',').count(), RULE_FIELD_COUNT);
        assert_eq!(MitmRule::decode(&line).unwrap(), rule);
    }

    #[test]
    fn test_round_trip_empty_set() {
        assert_eq!(encode_rules(&[]), "");
        assert_eq!(decode_rules("").unwrap(), vec![]);
    }

    #[test]
    fn test_round_trip_single_rule() {
        let rules = vec![sample_rule()];
        assert_eq!(decode_rules(&encode_rules(&rules)).unwrap(), rules);
    }

    #[test]
    fn test_round_trip_nineteen_mixed_rules() {
        let rules: Vec<MitmRule> = (0..19u8)
            .map(|i| {
                let kind = RuleKind::ALL[i as usize % RuleKind::ALL.len()];
                let condition = ConditionKind::ALL[i as usize % ConditionKind::ALL.len()];
                let rule = MitmRule::new(kind, condition)
                    .with_condition(
                        Pattern::from_slice(&[i, i.wrapping_mul(3)]).unwrap(),
                        ByteMask::from_bits(i.wrapping_mul(13)),
                    )
                    .with_action(
                        Pattern::from_slice(&[0xFF - i; 8]).unwrap(),
                        ByteMask::from_bits(!i),
                    );
                if i % 3 == 0 {
                    rule
                } else {
                    rule.with_target(&format!("{:X}", 0x100 + u32::from(i))).unwrap()
                }
            })
            .collect();

        let text = encode_rules(&rules);
        assert_eq!(text.lines().count(), 19);
        assert_eq!(decode_rules(&text).unwrap(), rules);
    }

    #[test]
    fn test_decode_rejects_short_line() {
        let err = decode_rules("0301,7E0,02\n").unwrap_err();
        assert!(matches!(err, MitmError::MalformedLine { line: 1, .. }));
    }

    #[test]
    fn test_decode_rejects_kind_out_of_range() {
        let line = "0309,0,00,00,00,00,00,00,00,00,0000,00,00,00,00,00,00,00,00";
        assert!(MitmRule::decode(line).is_err());
        let line = "0300,0,00,00,00,00,00,00,00,00,000f,00,00,00,00,00,00,00,00";
        assert!(MitmRule::decode(line).is_err());
    }

    #[test]
    fn test_pattern_too_long() {
        assert!(Pattern::from_slice(&[0; 9]).is_err());
        assert!("0".parse::<Pattern>().is_err());
    }

    #[test]
    fn test_target_validation() {
        assert!(MitmRule::new(RuleKind::SwapPayload, ConditionKind::PayloadMatches)
            .with_target("7E0,1")
            .is_err());
        let rule = MitmRule::new(RuleKind::SwapPayload, ConditionKind::PayloadMatches)
            .with_target("0x18DAF110")
            .unwrap();
        assert_eq!(rule.target_id(), Some("0x18DAF110"));
    }

    #[test]
    fn test_rule_file_name() {
        assert_eq!(rule_file_name(""), "rules.txt");
        assert_eq!(rule_file_name("speed"), "speed.txt");
        assert_eq!(rule_file_name("speed.cfg"), "speed.txt");
        assert_eq!(rule_file_name("a_very_long_rule_name.txt"), "a_very_long_.txt");
        assert!(rule_file_name("a_very_long_rule_name").len() <= MAX_RULE_FILE_NAME);
    }

    #[test]
    fn test_start_from_file() {
        let msg = start_from_file("speed.txt");
        assert_eq!(msg.action, ActionKind::EnableMitmMode);
        assert_eq!(msg.payload.as_ref(), b"speed.txt\0");
    }

    #[test]
    fn test_push_sequence() {
        let rules = vec![sample_rule(), MitmRule::new(RuleKind::DropFrame, ConditionKind::BytesLess)];
        let (mut push, open) = RulePush::start(&rules);
        assert_eq!(open.action, ActionKind::ReceiveRules);
        assert_eq!(open.payload_length, 0);

        let PushStep::Send(first) = push.on_ack() else {
            panic!("expected first rule");
        };
        assert_eq!(first.action, ActionKind::AddRule);
        assert_eq!(first.payload.last(), Some(&0u8));
        assert_eq!(
            &first.payload[..first.payload.len() - 1],
            sample_rule().encode().as_bytes()
        );

        assert!(matches!(push.on_ack(), PushStep::Send(_)));
        assert_eq!(push.sent(), 2);

        let PushStep::Send(enable) = push.on_ack() else {
            panic!("expected enable");
        };
        assert_eq!(enable.action, ActionKind::Mitm);
        assert_eq!(enable.payload_length, 0);
        assert!(push.is_enabling());

        assert_eq!(push.on_ack(), PushStep::Complete);
    }

    #[test]
    fn test_push_without_rules_enables_directly() {
        let (mut push, _) = RulePush::start(&[]);
        let PushStep::Send(enable) = push.on_ack() else {
            panic!("expected enable");
        };
        assert_eq!(enable.action, ActionKind::Mitm);
        assert_eq!(push.on_ack(), PushStep::Complete);
        assert_eq!(push.total(), 0);
    }
}
