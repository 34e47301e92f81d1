//! TP 2.0 channel setup, handled by the probe alongside UDS

use bytes::{BufMut, BytesMut};

use crate::message::{ActionKind, Message};

/// `START_TP` action opening a channel to `module_id`. The probe acknowledges with ACK/NACK.
pub fn build_start_tp(module_id: u32, channel_negotiation_id: u32) -> Message {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(module_id);
    buf.put_u32_le(channel_negotiation_id);
    Message::action(ActionKind::StartTp, buf.freeze())
}

/// Invoke one of the probe's TP routines by its function id
pub fn tp_function(function_id: u8) -> Message {
    Message::action(ActionKind::Tp, vec![function_id])
}
