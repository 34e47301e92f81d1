//! End-to-end tests: ProbeClient against the probe simulator over UDP
//!
//! Run with: cargo test -p canbadger-tests --test probe_e2e_test

use std::time::Duration;

use bytes::Bytes;
use canbadger_proto::commands::Gpio;
use canbadger_proto::mitm::{encode_rules, MITM_DIRECTORY};
use canbadger_proto::uds::{
    read_data_by_id, read_memory_by_address, service_id, AddressingType, DiagnosticSession,
    SecurityHijack, StartSession, UdsCanFormat,
};
use canbadger_proto::{
    ByteMask, ConditionKind, EntryKind, Interface, MitmRule, Pattern, ReplayQueue, RuleKind,
    StatusBit,
};
use canbadger_session::{ClientError, CaptureWorker, LinkState, SessionError, UdsLink};
use canbadger_sim::{SdFile, SimConfig, UdsSimConfig};
use canbadger_tests::SimHarness;
use pretty_assertions::assert_eq;
use serial_test::serial;

fn session_request() -> StartSession {
    StartSession {
        interface: Interface::Can1,
        local_id: 0x7E0,
        remote_id: 0x7E8,
        can_format: UdsCanFormat::Standard,
        enable_padding: false,
        padding_byte: 0,
        addressing: AddressingType::Standard,
        target_session: DiagnosticSession::Extended,
    }
}

fn drop_rule() -> MitmRule {
    MitmRule::new(RuleKind::DropFrame, ConditionKind::PayloadMatches)
        .with_target("7E0")
        .unwrap()
        .with_condition(
            Pattern::from_slice(&[0x02, 0x10, 0x03]).unwrap(),
            ByteMask::from_bits(0b0000_0111),
        )
}

// =============================================================================
// Settings
// =============================================================================

#[tokio::test]
#[serial]
async fn test_connect_and_read_settings() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    assert_eq!(client.state(), LinkState::Connected);
    let settings = client.settings().await.unwrap();
    assert_eq!(settings.id, "cb_sim");
    assert_eq!(settings.can1_speed, 500_000);
    assert!(settings.status.get(StatusBit::SdEnabled));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_update_and_save_settings() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    client.update_setting("id", "bench_probe").await.unwrap();
    client.update_setting("can2_speed", "250000").await.unwrap();

    let mut settings = client.settings().await.unwrap();
    assert_eq!(settings.id, "bench_probe");
    assert_eq!(settings.can2_speed, 250_000);

    settings.status.set(StatusBit::Can1Logging, true);
    client.update_settings(&settings).await.unwrap();
    client.save_settings(None).await.unwrap();

    let probe = harness.probe();
    assert!(probe.lock().settings().status.get(StatusBit::Can1Logging));
    assert_eq!(probe.lock().eeprom_writes(), 1);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_rejected_setting_fails() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let err = client.update_setting("can1_speed", "fast").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Session(SessionError::ProtocolNack { .. })
    ));

    // link is usable afterwards
    assert!(!client.is_busy());
    client.enable_test_mode().await.unwrap();
    assert!(harness.probe().lock().is_test_mode());

    harness.shutdown().await.unwrap();
}

// =============================================================================
// Capture
// =============================================================================

#[tokio::test]
#[serial]
async fn test_capture_receives_frames_and_stops() {
    let harness = SimHarness::start().await.unwrap();
    let transport = harness.transport().await.unwrap();
    let (handle, mut frames) = CaptureWorker::spawn(transport, harness.config());

    let mut received = Vec::new();
    while received.len() < 5 {
        let item = tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("no frame within 2s")
            .expect("capture ended early");
        received.push(item.unwrap());
    }
    assert!(harness.probe().lock().is_logging());
    for frame in &received {
        assert!((0x7F0..=0x7FF).contains(&frame.arbitration_id()));
    }
    let counters: Vec<_> = received.iter().map(|f| f.counter()).collect();
    assert!(counters.windows(2).all(|w| w[0] < w[1]));

    let stop = tokio::spawn(handle.stop());
    while frames.recv().await.is_some() {}
    let stats = stop.await.unwrap().unwrap();

    assert!(stats.stopped_cleanly);
    assert!(stats.frames >= 5);
    assert_eq!(stats.decode_errors, 0);
    assert!(!harness.probe().lock().is_logging());

    harness.shutdown().await.unwrap();
}

// =============================================================================
// Replay
// =============================================================================

#[tokio::test]
#[serial]
async fn test_replay_sends_every_repeat() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let mut queue = ReplayQueue::new();
    assert!(queue.enqueue_frame(2, Interface::Can1, 0x123, &[0xDE, 0xAD]));
    assert!(queue.enqueue_frame(1, Interface::Can2, 0x7DF, &[0x02, 0x01, 0x0D]));

    let sent = client.replay(queue).await.unwrap();
    assert_eq!(sent, 3);
    assert_eq!(harness.probe().lock().replayed().len(), 3);
    assert!(!client.is_busy());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_empty_replay_rejected() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let err = client.replay(ReplayQueue::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Session(SessionError::EmptyReplay)));
    assert!(harness.probe().lock().replayed().is_empty());

    harness.shutdown().await.unwrap();
}

// =============================================================================
// UDS
// =============================================================================

#[tokio::test]
#[serial]
async fn test_uds_session_and_reads() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let level = client
        .start_uds_session(&session_request())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(level, DiagnosticSession::Extended as u8);
    assert_eq!(client.uds_link(), UdsLink::Connected { level });

    let response = client
        .uds_request(service_id::READ_DATA_BY_ID, &read_data_by_id(0xF190))
        .await
        .unwrap();
    assert!(response.is_positive);
    assert_eq!(&response.payload[..3], &[0x62u8, 0xF1, 0x90]);
    assert_eq!(&response.payload[3..], b"cb_sim");

    let request = read_memory_by_address(0x1000, 16).unwrap();
    let response = client
        .uds_request(service_id::READ_MEMORY_BY_ADDRESS, &request)
        .await
        .unwrap();
    assert!(response.is_positive);
    assert_eq!(response.payload.len(), 17);
    assert_eq!(response.payload[0], 0x63);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_uds_without_session_is_negative() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let response = client
        .uds_request(service_id::READ_DATA_BY_ID, &read_data_by_id(0xF190))
        .await
        .unwrap();
    assert!(!response.is_positive);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_refused_uds_session() {
    let harness = SimHarness::with_config(SimConfig {
        uds: UdsSimConfig {
            accept_sessions: false,
        },
        ..Default::default()
    })
    .await
    .unwrap();
    let client = harness.client().await.unwrap();

    let err = client.start_uds_session(&session_request()).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Session(SessionError::ProtocolNack { .. })
    ));
    assert_eq!(client.uds_link(), UdsLink::Disconnected);

    let hijack = client
        .hijack(&SecurityHijack {
            local_id: 0x7E0,
            remote_id: 0x7E8,
            security_level: 1,
            session_level: 3,
        })
        .await
        .unwrap();
    assert!(!hijack.success);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_hijack_grants_session() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let response = client
        .hijack(&SecurityHijack {
            local_id: 0x7E0,
            remote_id: 0x7E8,
            security_level: 1,
            session_level: 3,
        })
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.session_level, 3);

    harness.shutdown().await.unwrap();
}

// =============================================================================
// SD card
// =============================================================================

#[tokio::test]
#[serial]
async fn test_file_roundtrip() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let content: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let packets = client
        .upload("/", "trace.bin", Bytes::from(content.clone()))
        .await
        .unwrap();
    assert!(packets > 1);
    assert_eq!(harness.probe().lock().file("/trace.bin"), Some(&content[..]));

    let entries = client.list_directory().await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.kind == EntryKind::File && e.path() == "/trace.bin"));
    assert!(entries
        .iter()
        .any(|e| e.kind == EntryKind::Directory && e.path() == MITM_DIRECTORY));

    let downloaded = client.download("/trace.bin").await.unwrap();
    assert_eq!(&downloaded[..], &content[..]);

    client.delete_file("/trace.bin").await.unwrap();
    assert!(harness.probe().lock().file("/trace.bin").is_none());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_delete_missing_file_fails() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let err = client.delete_file("/nope.txt").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Session(SessionError::ProtocolNack { .. })
    ));

    harness.shutdown().await.unwrap();
}

// =============================================================================
// MITM
// =============================================================================

#[tokio::test]
#[serial]
async fn test_push_rules_enables_mitm() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    let rules = vec![drop_rule(), drop_rule().with_target("123").unwrap()];
    let active = client.push_rules(&rules).await.unwrap();
    assert_eq!(active, 2);

    let probe = harness.probe();
    assert!(probe.lock().is_mitm_enabled());
    assert_eq!(probe.lock().active_rules(), &rules[..]);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_mitm_from_rule_file() {
    let rules = vec![drop_rule()];
    let harness = SimHarness::with_config(SimConfig {
        sd_files: vec![SdFile {
            path: format!("{MITM_DIRECTORY}/rules.txt"),
            content: encode_rules(&rules),
        }],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = harness.client().await.unwrap();

    assert!(client.start_mitm_from_file("missing.txt").await.is_err());
    client.start_mitm_from_file("rules.txt").await.unwrap();

    let probe = harness.probe();
    assert!(probe.lock().is_mitm_enabled());
    assert_eq!(probe.lock().active_rules(), &rules[..]);

    harness.shutdown().await.unwrap();
}

// =============================================================================
// GPIO and link control
// =============================================================================

#[tokio::test]
#[serial]
async fn test_gpio_set_and_query() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    client.set_gpio(Gpio::Two, true).await.unwrap();
    assert_eq!(harness.probe().lock().relays(), [false, true]);

    let state = client.query_gpio().await.unwrap();
    assert_eq!(state.as_deref(), Some(&[0u8, 1][..]));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_reset_then_reconnect() {
    let harness = SimHarness::start().await.unwrap();
    let client = harness.client().await.unwrap();

    client.enable_test_mode().await.unwrap();
    client.reset().await.unwrap();
    assert_eq!(client.state(), LinkState::Unconnected);
    assert!(client.settings().await.is_err());

    client.connect().await.unwrap();
    assert_eq!(client.state(), LinkState::Connected);
    assert!(!harness.probe().lock().is_test_mode());
    client.stop().await.unwrap();

    harness.shutdown().await.unwrap();
}
