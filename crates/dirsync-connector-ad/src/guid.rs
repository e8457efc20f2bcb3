//! Object identifiers.
//!
//! The canonical identifier is the `objectGUID` octet string as
//! `<GUID=32 hex digits>`, which Active Directory also accepts as a bind path.
//! The registry form (`f81d4fae-7dec-11d0-a765-00a0c91e6bf6`) is accepted on
//! input; its first three groups are little-endian on the wire.

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use uuid::Uuid;

const PREFIX: &str = "<GUID=";
const SUFFIX: &str = ">";

/// Canonical identifier for a raw `objectGUID`.
pub fn to_uid_value(guid: &[u8]) -> String {
    format!("{PREFIX}{}{SUFFIX}", hex::encode(guid))
}

/// Raw `objectGUID` bytes for an identifier in any accepted form.
pub fn parse_uid(value: &str) -> ConnectorResult<Vec<u8>> {
    let trimmed = value.trim();
    let malformed = || ConnectorError::usage(format!("malformed object identifier: {value}"));

    let inner = match trimmed.get(..PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(PREFIX) => trimmed[PREFIX.len()..]
            .strip_suffix(SUFFIX)
            .ok_or_else(malformed)?,
        _ => trimmed,
    };

    if inner.len() == 32 && inner.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(inner).map_err(|_| malformed());
    }
    if inner.contains('-') {
        let parsed = Uuid::parse_str(inner.trim_matches(|c| c == '{' || c == '}'))
            .map_err(|_| malformed())?;
        return Ok(parsed.to_bytes_le().to_vec());
    }
    Err(malformed())
}

/// Registry form of a raw `objectGUID`, for log output.
pub fn to_registry_form(guid: &[u8]) -> Option<String> {
    let bytes: [u8; 16] = guid.try_into().ok()?;
    Some(Uuid::from_bytes_le(bytes).hyphenated().to_string())
}
