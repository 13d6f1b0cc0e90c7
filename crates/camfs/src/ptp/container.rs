//! Wire container codec.
//!
//! Every container starts with the same 12-byte little-endian header: total length (u32),
//! container type (u16), operation/response/event code (u16) and transaction id (u32).
//! Command, response and event containers follow it with up to five u32 parameters; data
//! containers follow it with the raw payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codes::ContainerType;
use super::errors::PtpError;

pub const HEADER_LEN: usize = 12;
pub const MAX_PARAMS: usize = 5;

/// A decoded container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerType,
    pub code: u16,
    pub transaction_id: u32,
    /// Parameters of a command, response or event container. Empty for data containers.
    pub params: Vec<u32>,
    /// Payload of a data container. Empty otherwise.
    pub payload: Bytes,
}

impl Container {
    pub fn command(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Self::with_params(ContainerType::Command, code, transaction_id, params)
    }

    pub fn response(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Self::with_params(ContainerType::Response, code, transaction_id, params)
    }

    pub fn event(code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Self::with_params(ContainerType::Event, code, transaction_id, params)
    }

    pub fn data(code: u16, transaction_id: u32, payload: Bytes) -> Self {
        Self {
            kind: ContainerType::Data,
            code,
            transaction_id,
            params: Vec::new(),
            payload,
        }
    }

    fn with_params(kind: ContainerType, code: u16, transaction_id: u32, params: &[u32]) -> Self {
        Self {
            kind,
            code,
            transaction_id,
            params: params.to_vec(),
            payload: Bytes::new(),
        }
    }

    /// Total encoded length including the header.
    pub fn encoded_len(&self) -> usize {
        match self.kind {
            ContainerType::Data => HEADER_LEN + self.payload.len(),
            _ => HEADER_LEN + self.params.len() * 4,
        }
    }

    /// Encodes the container into a single buffer.
    pub fn encode(&self) -> Result<Bytes, PtpError> {
        if self.kind != ContainerType::Data && self.params.len() > MAX_PARAMS {
            return Err(PtpError::invalid_argument(format!(
                "{} parameters exceed the limit of {MAX_PARAMS}",
                self.params.len()
            )));
        }
        let length = self.encoded_len();
        let mut buf = BytesMut::with_capacity(length);
        put_header(&mut buf, length, self.kind, self.code, self.transaction_id)?;
        if self.kind == ContainerType::Data {
            buf.put_slice(&self.payload);
        } else {
            for param in &self.params {
                buf.put_u32_le(*param);
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes exactly one container from `frame`.
    ///
    /// `frame` must be the complete container: its length has to match the header.
    pub fn decode(frame: &[u8]) -> Result<Self, PtpError> {
        let Some(length) = peek_length(frame) else {
            return Err(PtpError::framing(format!("container shorter than header ({} bytes)", frame.len())));
        };
        if length < HEADER_LEN {
            return Err(PtpError::framing(format!("declared length {length} is below the header size")));
        }
        if length != frame.len() {
            return Err(PtpError::framing(format!(
                "declared length {length} does not match frame of {} bytes",
                frame.len()
            )));
        }

        let mut buf = &frame[4..];
        let kind = ContainerType::from_code(buf.get_u16_le());
        let code = buf.get_u16_le();
        let transaction_id = buf.get_u32_le();

        match kind {
            ContainerType::Data => Ok(Self::data(code, transaction_id, Bytes::copy_from_slice(buf))),
            ContainerType::Command | ContainerType::Response | ContainerType::Event => {
                if buf.len() % 4 != 0 {
                    return Err(PtpError::framing(format!("parameter block of {} bytes is not u32-aligned", buf.len())));
                }
                let count = buf.len() / 4;
                if count > MAX_PARAMS {
                    return Err(PtpError::framing(format!("{count} parameters exceed the limit of {MAX_PARAMS}")));
                }
                let params: Vec<u32> = (0..count).map(|_| buf.get_u32_le()).collect();
                Ok(Self::with_params(kind, code, transaction_id, &params))
            }
            ContainerType::Other(raw) => Err(PtpError::framing(format!("unknown container type 0x{raw:04X}"))),
        }
    }
}

/// Encodes only the header of a data container carrying `payload_len` bytes.
///
/// The engine sends this header and the payload as two transfers so large uploads are never
/// copied into a combined buffer.
pub fn data_header(code: u16, transaction_id: u32, payload_len: usize) -> Result<Bytes, PtpError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, HEADER_LEN + payload_len, ContainerType::Data, code, transaction_id)?;
    Ok(buf.freeze())
}

/// Reads the declared length from the first four bytes, if present.
pub fn peek_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let mut head = &buf[..4];
    Some(head.get_u32_le() as usize)
}

fn put_header(
    buf: &mut BytesMut,
    length: usize,
    kind: ContainerType,
    code: u16,
    transaction_id: u32,
) -> Result<(), PtpError> {
    let length = u32::try_from(length)
        .map_err(|_| PtpError::invalid_argument(format!("container of {length} bytes exceeds the 32-bit length field")))?;
    buf.put_u32_le(length);
    buf.put_u16_le(kind.code());
    buf.put_u16_le(code);
    buf.put_u32_le(transaction_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_layout() {
        let bytes = Container::command(0x1002, 1, &[1]).encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0x10, 0, 0, 0, 0x01, 0, 0x02, 0x10, 0x01, 0, 0, 0, 0x01, 0, 0, 0]
        );
    }

    #[test]
    fn test_data_header_declares_payload_length() {
        let header = data_header(0x100D, 7, 100).unwrap();
        assert_eq!(header.len(), HEADER_LEN);
        assert_eq!(peek_length(&[header.as_ref(), &[0u8; 100][..]].concat()), Some(112));
        assert_eq!(&header[4..6], &[0x02, 0x00]);
    }

    #[test]
    fn test_decode_response_with_params() {
        let encoded = Container::response(0x2001, 9, &[0x0001_0001, 42]).encode().unwrap();
        let decoded = Container::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, ContainerType::Response);
        assert_eq!(decoded.code, 0x2001);
        assert_eq!(decoded.transaction_id, 9);
        assert_eq!(decoded.params, vec![0x0001_0001, 42]);
    }

    #[test]
    fn test_decode_data_keeps_payload() {
        let encoded = Container::data(0x1009, 3, Bytes::from_static(b"jpegdata")).encode().unwrap();
        let decoded = Container::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, ContainerType::Data);
        assert_eq!(decoded.payload.as_ref(), b"jpegdata");
        assert!(decoded.params.is_empty());
    }

    #[test]
    fn test_too_many_params_rejected_locally() {
        let err = Container::command(0x1007, 1, &[1, 2, 3, 4, 5, 6]).encode().unwrap_err();
        assert!(matches!(err, PtpError::InvalidArgument { .. }));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(matches!(Container::decode(&[1, 2, 3]), Err(PtpError::Framing { .. })));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut encoded = Container::response(0x2001, 1, &[]).encode().unwrap().to_vec();
        encoded.push(0);
        assert!(matches!(Container::decode(&encoded), Err(PtpError::Framing { .. })));
    }

    #[test]
    fn test_decode_rejects_unaligned_params() {
        let mut frame = Container::response(0x2001, 1, &[5]).encode().unwrap().to_vec();
        frame.truncate(14);
        frame[0] = 14;
        assert!(matches!(Container::decode(&frame), Err(PtpError::Framing { .. })));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let mut frame = Container::response(0x2001, 1, &[]).encode().unwrap().to_vec();
        frame[4] = 0x09;
        assert!(matches!(Container::decode(&frame), Err(PtpError::Framing { .. })));
    }
}
