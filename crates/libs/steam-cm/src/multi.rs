//! Multi envelopes: several messages batched into one, optionally zipped.

use std::io::{Cursor, Read};

use prost::Message as _;

use crate::error::ProtocolError;
use crate::header::Reader;
use crate::proto::CMsgMulti;

/// Nesting limit for multi envelopes carried inside multi envelopes.
pub const MAX_MULTI_DEPTH: usize = 8;

/// Splits the payload of a multi message into the messages it carries, in
/// order. Each returned buffer starts with its own message header.
pub fn expand(payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let multi = CMsgMulti::decode(payload)?;
    let body = multi.message_body.unwrap_or_default();
    let declared = multi.size_unzipped.unwrap_or(0) as usize;

    let body = if declared > 0 { unzip_single(&body, declared)? } else { body };
    split_records(&body)
}

/// Extracts the only entry of a zip archive and checks its size.
pub fn unzip_single(archive: &[u8], expected: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive))?;
    if archive.len() != 1 {
        let found = archive.len();
        return Err(ProtocolError::Decompress(format!("expected one archive entry, found {found}")));
    }

    let entry = archive.by_index(0)?;
    log::trace!("multi entry {:?}: {} bytes", entry.name(), entry.size());
    let mut out = Vec::with_capacity(expected);
    // One byte past the declared size is enough to detect a mismatch.
    entry
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|err| ProtocolError::Decompress(err.to_string()))?;

    if out.len() != expected {
        return Err(ProtocolError::SizeMismatch { declared: expected, actual: out.len() });
    }
    Ok(out)
}

fn split_records(body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut reader = Reader::new(body, "multi record");
    let mut messages = Vec::new();
    while !reader.is_empty() {
        let len = reader.u32()? as usize;
        messages.push(reader.take(len)?.to_vec());
    }
    Ok(messages)
}
