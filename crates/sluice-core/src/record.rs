//! The transferable record unit, transfer framing flags, and the byte
//! codec seam.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// A single in-flight record.
///
/// Ids are assigned by the producing operator instance and increase
/// monotonically, which is what allows the two data paths (buffered
/// queues and direct transfer) to be reconciled during a switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    id: u64,
    payload: Vec<u8>,
}

impl SwitchRecord {
    /// Creates a record with the given id and opaque payload.
    #[must_use]
    pub fn new(id: u64, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// The record's sequence id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The opaque payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the record, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Byte-level record codec.
///
/// Injectable so an embedding engine can frame records however its data
/// plane already does; [`BincodeCodec`] is the default.
pub trait RecordCodec: fmt::Debug + Send + Sync {
    /// Serializes a record for the transfer channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Codec`] if serialization fails.
    fn encode(&self, record: &SwitchRecord) -> Result<Vec<u8>, TransferError>;

    /// Deserializes a record received from the transfer channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Codec`] if the bytes are not a valid
    /// record.
    fn decode(&self, bytes: &[u8]) -> Result<SwitchRecord, TransferError>;
}

/// Default codec over bincode with the standard configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl RecordCodec for BincodeCodec {
    fn encode(&self, record: &SwitchRecord) -> Result<Vec<u8>, TransferError> {
        bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| TransferError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<SwitchRecord, TransferError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransferError::Codec(e.to_string()))?;
        Ok(record)
    }
}

/// Framing control flags for the record transfer channel.
///
/// A flag frame changes how the receiver interprets subsequent record
/// frames on the same connection: what kind of record they carry, and
/// which buffer they are destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    /// Subsequent record frames carry codec-serialized switch records.
    SwitchRecord,
    /// Subsequent record frames carry raw engine payloads.
    GeneralRecord,
    /// Subsequent records are staged in the temporary replay buffer.
    TemporaryQueue,
    /// Subsequent records go to the general input queue.
    GeneralQueue,
}

impl ControlFlag {
    /// The flag's wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SwitchRecord => "SWITCH_RECORD_FLAG",
            Self::GeneralRecord => "GENERAL_RECORD_FLAG",
            Self::TemporaryQueue => "TEMPORARY_QUEUE_FLAG",
            Self::GeneralQueue => "GENERAL_QUEUE_FLAG",
        }
    }

    /// Parses a flag from its wire spelling.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::UnknownFlag`] for anything else.
    pub fn parse(s: &str) -> Result<Self, TransferError> {
        match s {
            "SWITCH_RECORD_FLAG" => Ok(Self::SwitchRecord),
            "GENERAL_RECORD_FLAG" => Ok(Self::GeneralRecord),
            "TEMPORARY_QUEUE_FLAG" => Ok(Self::TemporaryQueue),
            "GENERAL_QUEUE_FLAG" => Ok(Self::GeneralQueue),
            other => Err(TransferError::UnknownFlag(other.to_string())),
        }
    }
}

impl fmt::Display for ControlFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let codec = BincodeCodec;
        let record = SwitchRecord::new(42, b"payload".to_vec());
        let bytes = codec.encode(&record).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.id(), 42);
        assert_eq!(back.payload(), b"payload");
    }

    #[test]
    fn test_codec_empty_payload() {
        let codec = BincodeCodec;
        let record = SwitchRecord::new(0, Vec::new());
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_decode_invalid() {
        let codec = BincodeCodec;
        assert!(codec.decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_flag_wire_spellings() {
        assert_eq!(ControlFlag::SwitchRecord.as_str(), "SWITCH_RECORD_FLAG");
        assert_eq!(ControlFlag::GeneralRecord.as_str(), "GENERAL_RECORD_FLAG");
        assert_eq!(ControlFlag::TemporaryQueue.as_str(), "TEMPORARY_QUEUE_FLAG");
        assert_eq!(ControlFlag::GeneralQueue.as_str(), "GENERAL_QUEUE_FLAG");
    }

    #[test]
    fn test_flag_parse_round_trip() {
        for flag in [
            ControlFlag::SwitchRecord,
            ControlFlag::GeneralRecord,
            ControlFlag::TemporaryQueue,
            ControlFlag::GeneralQueue,
        ] {
            assert_eq!(ControlFlag::parse(flag.as_str()).unwrap(), flag);
        }
    }

    #[test]
    fn test_flag_parse_unknown() {
        let err = ControlFlag::parse("NOT_A_FLAG").unwrap_err();
        assert!(matches!(err, TransferError::UnknownFlag(_)));
    }
}
