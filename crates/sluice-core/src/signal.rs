//! Control-signal vocabulary and the signal channel seam.
//!
//! Signals are small named control messages routed to a logical node of
//! a pipeline over an external bus. Delivery is at-most-once and
//! fire-and-forget; where an acknowledgement is needed it is itself a
//! signal ([`SwitchSignal::Transferred`]).

use async_trait::async_trait;

use crate::error::SignalError;
use crate::plan::SwitchPlan;

/// A control signal exchanged between switch roles.
///
/// Payload encodings are part of the wire contract: `HeadId` is two
/// ASCII decimals joined by a comma, the counting signals are a single
/// ASCII decimal, the switch request carries a JSON plan, and the rest
/// carry the literal `true`.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchSignal {
    /// Resume consuming, attached to the sending node.
    Emit,
    /// Head of the deciding node's input buffer plus its processed
    /// floor; requests a partial replay of the ids between them.
    HeadId {
        /// Oldest id buffered at the deciding node.
        head_id: u64,
        /// The deciding node's processed floor.
        last_processed_id: u64,
    },
    /// Request a full replay of this many records.
    Transfer(u64),
    /// How many records the replay actually forwarded.
    Transferred(u64),
    /// The deciding side finished reconciling.
    Synchronized,
    /// Take over the active path.
    GoToActive,
    /// Stop serving the old path.
    GoToPassive,
    /// A switch was requested; carries the plan.
    SwitchRequested(SwitchPlan),
    /// The preceding node's emission high-water mark.
    LastEmitted(u64),
}

impl SwitchSignal {
    /// The signal's wire name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Emit => "Emit",
            Self::HeadId { .. } => "HeadId",
            Self::Transfer(_) => "Transfer",
            Self::Transferred(_) => "Transferred",
            Self::Synchronized => "Synchronized",
            Self::GoToActive => "GoToActive",
            Self::GoToPassive => "GoToPassive",
            Self::SwitchRequested(_) => "SwitchRequested",
            Self::LastEmitted(_) => "LastEmitted",
        }
    }

    /// Encodes the signal's payload for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Payload`] if the switch plan cannot be
    /// encoded.
    pub fn encode_payload(&self) -> Result<Vec<u8>, SignalError> {
        match self {
            Self::Emit | Self::Synchronized | Self::GoToActive | Self::GoToPassive => {
                Ok(b"true".to_vec())
            }
            Self::HeadId {
                head_id,
                last_processed_id,
            } => Ok(format!("{head_id},{last_processed_id}").into_bytes()),
            Self::Transfer(count) | Self::Transferred(count) | Self::LastEmitted(count) => {
                Ok(count.to_string().into_bytes())
            }
            Self::SwitchRequested(plan) => plan.to_payload(),
        }
    }

    /// Decodes a signal from its wire name and payload.
    ///
    /// Boolean payloads are not inspected; malformed numeric or plan
    /// payloads are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::UnknownSignal`] for an unrecognized name
    /// and [`SignalError::Payload`] for a payload that does not match
    /// the name's encoding.
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self, SignalError> {
        match name {
            "Emit" => Ok(Self::Emit),
            "Synchronized" => Ok(Self::Synchronized),
            "GoToActive" => Ok(Self::GoToActive),
            "GoToPassive" => Ok(Self::GoToPassive),
            "HeadId" => {
                let text = payload_str(name, payload)?;
                let (head, floor) = text.split_once(',').ok_or_else(|| SignalError::Payload {
                    signal: name.to_string(),
                    reason: "expected \"<headId>,<lastProcessedId>\"".to_string(),
                })?;
                Ok(Self::HeadId {
                    head_id: parse_u64(name, head)?,
                    last_processed_id: parse_u64(name, floor)?,
                })
            }
            "Transfer" => Ok(Self::Transfer(parse_u64(name, payload_str(name, payload)?)?)),
            "Transferred" => Ok(Self::Transferred(parse_u64(
                name,
                payload_str(name, payload)?,
            )?)),
            "LastEmitted" => Ok(Self::LastEmitted(parse_u64(
                name,
                payload_str(name, payload)?,
            )?)),
            "SwitchRequested" => Ok(Self::SwitchRequested(SwitchPlan::from_payload(payload)?)),
            other => Err(SignalError::UnknownSignal(other.to_string())),
        }
    }
}

fn payload_str<'a>(signal: &str, payload: &'a [u8]) -> Result<&'a str, SignalError> {
    std::str::from_utf8(payload).map_err(|_| SignalError::Payload {
        signal: signal.to_string(),
        reason: "payload is not UTF-8".to_string(),
    })
}

fn parse_u64(signal: &str, text: &str) -> Result<u64, SignalError> {
    text.trim().parse().map_err(|_| SignalError::Payload {
        signal: signal.to_string(),
        reason: format!("expected an integer, got {text:?}"),
    })
}

/// A routed signal: who sent it, where it goes.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    /// The pipeline the signal belongs to.
    pub pipeline: String,
    /// Logical name of the sending node.
    pub from: String,
    /// Logical name of the receiving node.
    pub to: String,
    /// The signal itself.
    pub signal: SwitchSignal,
}

/// Fire-and-forget control-signal transmission.
///
/// Delivery is at-most-once and asynchronous; ordering is preserved
/// only for signals sent by the same node to the same target. Backed by
/// the external event bus in production and by an in-process router in
/// tests.
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Sends `signal` to `node` of `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError`] if the signal cannot be encoded for the
    /// underlying bus; an unreachable target is not an error.
    async fn send(&self, pipeline: &str, node: &str, signal: SwitchSignal) -> Result<(), SignalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RoleIdentity;

    #[test]
    fn test_boolean_payloads() {
        for signal in [
            SwitchSignal::Emit,
            SwitchSignal::Synchronized,
            SwitchSignal::GoToActive,
            SwitchSignal::GoToPassive,
        ] {
            assert_eq!(signal.encode_payload().unwrap(), b"true");
        }
    }

    #[test]
    fn test_head_id_encoding() {
        let signal = SwitchSignal::HeadId {
            head_id: 30,
            last_processed_id: 10,
        };
        assert_eq!(signal.name(), "HeadId");
        assert_eq!(signal.encode_payload().unwrap(), b"30,10");
    }

    #[test]
    fn test_counting_encodings() {
        assert_eq!(SwitchSignal::Transfer(40).encode_payload().unwrap(), b"40");
        assert_eq!(
            SwitchSignal::Transferred(7).encode_payload().unwrap(),
            b"7"
        );
        assert_eq!(
            SwitchSignal::LastEmitted(120).encode_payload().unwrap(),
            b"120"
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let signals = [
            SwitchSignal::Emit,
            SwitchSignal::HeadId {
                head_id: 30,
                last_processed_id: 10,
            },
            SwitchSignal::Transfer(40),
            SwitchSignal::Transferred(0),
            SwitchSignal::Synchronized,
            SwitchSignal::GoToActive,
            SwitchSignal::GoToPassive,
            SwitchSignal::LastEmitted(99),
        ];
        for signal in signals {
            let payload = signal.encode_payload().unwrap();
            let back = SwitchSignal::decode(signal.name(), &payload).unwrap();
            assert_eq!(back, signal);
        }
    }

    #[test]
    fn test_decode_switch_requested() {
        let plan = SwitchPlan {
            pipeline: "pipe".to_string(),
            roles: RoleIdentity {
                preceding: "src".to_string(),
                original_intermediary: "op-a".to_string(),
                target_intermediary: "op-b".to_string(),
                original_end: "sink".to_string(),
                target_end: "sink".to_string(),
            },
            transfer_port: 9100,
        };
        let signal = SwitchSignal::SwitchRequested(plan.clone());
        let payload = signal.encode_payload().unwrap();
        let back = SwitchSignal::decode("SwitchRequested", &payload).unwrap();
        assert_eq!(back, SwitchSignal::SwitchRequested(plan));
    }

    #[test]
    fn test_decode_unknown_name() {
        let err = SwitchSignal::decode("Bogus", b"true").unwrap_err();
        assert!(matches!(err, SignalError::UnknownSignal(_)));
    }

    #[test]
    fn test_decode_malformed_head_id() {
        assert!(SwitchSignal::decode("HeadId", b"30").is_err());
        assert!(SwitchSignal::decode("HeadId", b"x,y").is_err());
        assert!(SwitchSignal::decode("HeadId", &[0xff, b',', 0xff]).is_err());
    }

    #[test]
    fn test_decode_malformed_count() {
        assert!(SwitchSignal::decode("Transfer", b"forty").is_err());
        assert!(SwitchSignal::decode("Transferred", b"-1").is_err());
    }

    #[test]
    fn test_boolean_decode_ignores_payload() {
        assert_eq!(
            SwitchSignal::decode("Emit", b"").unwrap(),
            SwitchSignal::Emit
        );
        assert_eq!(
            SwitchSignal::decode("GoToPassive", b"true").unwrap(),
            SwitchSignal::GoToPassive
        );
    }
}
