//! Signed length-prefixed framing for the record transfer channel.
//!
//! Every frame starts with a 4-byte big-endian signed length. A
//! positive length introduces that many bytes of codec-serialized
//! record; a negative length introduces `|length|` bytes of ASCII
//! control-flag text; a zero length carries nothing and is skipped.
//! The sign is what lets control flags travel in-band on the same
//! connection as the records they describe.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sluice_core::record::ControlFlag;
use sluice_core::TransferError;

/// Largest payload a signed 32-bit prefix can describe.
const MAX_PREFIX_BYTES: usize = i32::MAX as usize;

/// One frame of the transfer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    /// Codec-serialized record bytes.
    Record(Vec<u8>),
    /// A framing control flag.
    Flag(ControlFlag),
    /// A zero-length frame; carries nothing.
    Empty,
}

/// Writes one frame.
///
/// # Errors
///
/// Returns [`TransferError::FrameTooLarge`] if the payload cannot be
/// described by a signed 32-bit prefix, or [`TransferError::Io`] on a
/// write failure.
pub async fn write_frame<W>(writer: &mut W, frame: &TransferFrame) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    match frame {
        TransferFrame::Record(bytes) => {
            let len = i32::try_from(bytes.len()).map_err(|_| TransferError::FrameTooLarge {
                size: bytes.len(),
                max: MAX_PREFIX_BYTES,
            })?;
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(bytes).await?;
        }
        TransferFrame::Flag(flag) => {
            let text = flag.as_str().as_bytes();
            let len = i32::try_from(text.len()).map_err(|_| TransferError::FrameTooLarge {
                size: text.len(),
                max: MAX_PREFIX_BYTES,
            })?;
            writer.write_all(&(-len).to_be_bytes()).await?;
            writer.write_all(text).await?;
        }
        TransferFrame::Empty => {
            writer.write_all(&0i32.to_be_bytes()).await?;
        }
    }
    Ok(())
}

/// Reads one frame, returning `None` on a clean close.
///
/// A connection that ends exactly on a frame boundary is a normal
/// shutdown; one that ends mid-frame is an error.
///
/// # Errors
///
/// Returns [`TransferError::FrameTooLarge`] if the prefix exceeds
/// `max_frame_bytes`, [`TransferError::UnknownFlag`] for an
/// unrecognized flag frame, or [`TransferError::Io`] on a read
/// failure.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<TransferFrame>, TransferError>
where
    R: AsyncRead + Unpin,
{
    // Only a close before the first prefix byte is a clean shutdown.
    let mut len_buf = [0u8; 4];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = i32::from_be_bytes(len_buf);
    if len == 0 {
        return Ok(Some(TransferFrame::Empty));
    }

    let size = len.unsigned_abs() as usize;
    if size > max_frame_bytes {
        return Err(TransferError::FrameTooLarge {
            size,
            max: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;

    if len > 0 {
        return Ok(Some(TransferFrame::Record(payload)));
    }

    let text = String::from_utf8(payload)
        .map_err(|_| TransferError::UnknownFlag("<non-utf8>".to_string()))?;
    let flag = ControlFlag::parse(text.trim())?;
    Ok(Some(TransferFrame::Flag(flag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::record::{BincodeCodec, RecordCodec, SwitchRecord};

    const MAX: usize = 1_048_576;

    async fn encode(frame: &TransferFrame) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(&mut buf, frame).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_record_frame_round_trip() {
        let codec = BincodeCodec;
        let record = SwitchRecord::new(7, b"seven".to_vec());
        let bytes = codec.encode(&record).unwrap();

        let buf = encode(&TransferFrame::Record(bytes.clone())).await;
        assert_eq!(&buf[..4], &i32::try_from(bytes.len()).unwrap().to_be_bytes());

        let mut reader = buf.as_slice();
        let frame = read_frame(&mut reader, MAX).await.unwrap().unwrap();
        assert_eq!(frame, TransferFrame::Record(bytes.clone()));
        if let TransferFrame::Record(bytes) = frame {
            assert_eq!(codec.decode(&bytes).unwrap(), record);
        }
    }

    #[tokio::test]
    async fn test_flag_frame_uses_negative_prefix() {
        let buf = encode(&TransferFrame::Flag(ControlFlag::SwitchRecord)).await;
        // "SWITCH_RECORD_FLAG" is 18 bytes, so the prefix is -18.
        assert_eq!(&buf[..4], &(-18i32).to_be_bytes());
        assert_eq!(&buf[4..], b"SWITCH_RECORD_FLAG");

        let mut reader = buf.as_slice();
        assert_eq!(
            read_frame(&mut reader, MAX).await.unwrap(),
            Some(TransferFrame::Flag(ControlFlag::SwitchRecord))
        );
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let buf = encode(&TransferFrame::Empty).await;
        assert_eq!(buf, 0i32.to_be_bytes());

        let mut reader = buf.as_slice();
        assert_eq!(
            read_frame(&mut reader, MAX).await.unwrap(),
            Some(TransferFrame::Empty)
        );
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let mut reader: &[u8] = &[];
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mid_frame_eof_is_error() {
        let mut buf = 10i32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader, MAX).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn test_torn_length_prefix_is_error() {
        let buf = 10i32.to_be_bytes();
        let mut reader = &buf[..2];
        let err = read_frame(&mut reader, MAX).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let buf = 2_000_000i32.to_be_bytes();
        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader, MAX).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::FrameTooLarge { size: 2_000_000, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_flag_rejected() {
        let text = b"NOT_A_FLAG";
        let mut buf = (-i32::try_from(text.len()).unwrap()).to_be_bytes().to_vec();
        buf.extend_from_slice(text);
        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader, MAX).await.unwrap_err();
        assert!(matches!(err, TransferError::UnknownFlag(_)));
    }

    #[tokio::test]
    async fn test_frames_stream_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &TransferFrame::Flag(ControlFlag::TemporaryQueue))
            .await
            .unwrap();
        write_frame(&mut buf, &TransferFrame::Empty).await.unwrap();
        write_frame(&mut buf, &TransferFrame::Record(b"rec".to_vec()))
            .await
            .unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(
            read_frame(&mut reader, MAX).await.unwrap(),
            Some(TransferFrame::Flag(ControlFlag::TemporaryQueue))
        );
        assert_eq!(
            read_frame(&mut reader, MAX).await.unwrap(),
            Some(TransferFrame::Empty)
        );
        assert_eq!(
            read_frame(&mut reader, MAX).await.unwrap(),
            Some(TransferFrame::Record(b"rec".to_vec()))
        );
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), None);
    }
}
