//! Builders for the payload-light probe commands

use crate::message::{ActionKind, Message};

/// Relay output on the probe board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpio {
    One,
    Two,
}

impl Gpio {
    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            _ => None,
        }
    }
}

/// `LOG_RAW_CAN_TRAFFIC` with the bridge-mode flag
pub fn start_logging(bridge_mode: bool) -> Message {
    Message::action(ActionKind::LogRawCanTraffic, vec![u8::from(bridge_mode)])
}

pub fn stop_current_action() -> Message {
    Message::command(ActionKind::StopCurrentAction)
}

pub fn reset() -> Message {
    Message::command(ActionKind::Reset)
}

pub fn enable_test_mode() -> Message {
    Message::command(ActionKind::EnableTestMode)
}

/// Drive a relay output high or low
pub fn set_gpio(gpio: Gpio, high: bool) -> Message {
    Message::action(ActionKind::Relay, vec![gpio.number(), u8::from(high)])
}

/// `RELAY` without payload, asking for the relay state
pub fn query_gpio() -> Message {
    Message::command(ActionKind::Relay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_start_payload() {
        assert_eq!(start_logging(false).payload.as_ref(), &[0]);
        assert_eq!(start_logging(true).payload.as_ref(), &[1]);
    }

    #[test]
    fn test_gpio_payload() {
        let msg = set_gpio(Gpio::Two, true);
        assert_eq!(msg.action, ActionKind::Relay);
        assert_eq!(msg.payload.as_ref(), &[2, 1]);
        assert_eq!(query_gpio().payload_length, 0);
        assert_eq!(Gpio::from_number(3), None);
    }
}
