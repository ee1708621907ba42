//! VT01 framing: `u32 LE body length | "VT01" | body`.
//!
//! Reading is two-phase: the transport hands over the 8 header bytes, learns
//! the body length, then hands over exactly that many bytes.

use crate::crypt::crypted_len;
use crate::error::ProtocolError;
use crate::session::Session;

pub const MAGIC: [u8; 4] = *b"VT01";
pub const FRAME_HEADER_LEN: usize = 8;

/// Frames larger than this are treated as corruption rather than allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Wraps `payload` into a frame, encrypting the body with the session key
/// when `encrypt` is set.
pub fn encode(payload: &[u8], session: &Session, encrypt: bool) -> Result<Vec<u8>, ProtocolError> {
    if encrypt {
        let key = session.key.as_ref().ok_or(ProtocolError::Cipher("no session key"))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + crypted_len(payload.len()));
        let body = key.encrypt(payload);
        write_header(&mut frame, body.len())?;
        frame.extend_from_slice(&body);
        Ok(frame)
    } else {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        write_header(&mut frame, payload.len())?;
        frame.extend_from_slice(payload);
        Ok(frame)
    }
}

fn write_header(out: &mut Vec<u8>, body_len: usize) -> Result<(), ProtocolError> {
    let len = u32::try_from(body_len).map_err(|_| ProtocolError::Truncated {
        what: "frame length",
        needed: body_len,
        available: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&MAGIC);
    Ok(())
}

/// Validates the 8-byte frame header and returns the declared body length.
pub fn decode_header(header: &[u8]) -> Result<usize, ProtocolError> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::Truncated {
            what: "frame header",
            needed: FRAME_HEADER_LEN,
            available: header.len(),
        });
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[4..8]);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Truncated {
            what: "frame body",
            needed: len,
            available: MAX_FRAME_LEN,
        });
    }

    Ok(len)
}

/// Recovers the payload from a frame body.
pub fn decode_body(
    body: &[u8],
    session: &Session,
    encrypted: bool,
) -> Result<Vec<u8>, ProtocolError> {
    if encrypted {
        let key = session.key.as_ref().ok_or(ProtocolError::Cipher("no session key"))?;
        key.decrypt(body)
    } else {
        Ok(body.to_vec())
    }
}

/// Decodes one complete frame held in memory.
pub fn decode(frame: &[u8], session: &Session, encrypted: bool) -> Result<Vec<u8>, ProtocolError> {
    let len = decode_header(frame)?;
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() < len {
        return Err(ProtocolError::Truncated {
            what: "frame body",
            needed: len,
            available: body.len(),
        });
    }
    decode_body(&body[..len], session, encrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::SessionKey;

    const LENGTHS: [usize; 7] = [0, 1, 15, 16, 17, 4095, 4096];

    fn encrypted_session() -> Session {
        let mut session = Session::new();
        session.key = Some(SessionKey::new([0x42; 32]));
        session.encrypted = true;
        session
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn plaintext_roundtrip() {
        let session = Session::new();
        for len in LENGTHS {
            let p = payload(len);
            let frame = encode(&p, &session, false).expect("encode");
            assert_eq!(frame.len(), FRAME_HEADER_LEN + len);
            assert_eq!(decode(&frame, &session, false).expect("decode"), p);
        }
    }

    #[test]
    fn encrypted_roundtrip() {
        let session = encrypted_session();
        for len in LENGTHS {
            let p = payload(len);
            let frame = encode(&p, &session, true).expect("encode");
            assert_eq!(frame.len(), FRAME_HEADER_LEN + crypted_len(len));
            assert_eq!(decode(&frame, &session, true).expect("decode"), p);
        }
    }

    #[test]
    fn length_field_describes_body() {
        let session = encrypted_session();
        let frame = encode(&[1, 2, 3], &session, true).expect("encode");
        assert_eq!(decode_header(&frame).expect("header"), 32);
        assert_eq!(&frame[4..8], b"VT01");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = encode(b"hi", &Session::new(), false).expect("encode");
        frame[4] = b'X';
        assert!(matches!(decode_header(&frame), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn rejects_corrupted_ciphertext() {
        let session = encrypted_session();
        let mut frame = encode(&payload(40), &session, true).expect("encode");
        // Flipping the previous ciphertext block flips the padding byte.
        let prev_block_end = frame.len() - 17;
        frame[prev_block_end] ^= 0xFF;
        assert!(decode(&frame, &session, true).is_err());
    }
}
