//! Request and response controls Active Directory searches rely on.
//!
//! Paged results come straight from `ldap3`; sort and VLV values are built
//! with its ASN.1 types.

use bytes::BytesMut;
use ldap3::asn1::{
    parse_tag, parse_uint, write, ASNTag, Boolean, Integer, OctetString, Sequence, Tag, TagClass,
    Types,
};
use ldap3::controls::{Control, ControlType, PagedResults, RawControl};

use super::{NativeError, NativeErrorKind, NativeResult};

/// Server-side sort request (RFC 2891).
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
/// Virtual list view request.
pub const VLV_REQUEST_OID: &str = "2.16.840.1.113730.3.4.9";
/// Virtual list view response.
pub const VLV_RESPONSE_OID: &str = "2.16.840.1.113730.3.4.10";
/// Return tombstones along with live entries.
pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";
/// Delete an entry with its subtree in one request.
pub const TREE_DELETE_OID: &str = "1.2.840.113556.1.4.805";

fn encode(tag: Tag) -> NativeResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, tag.into_structure()).map_err(|e| {
        NativeError::new(NativeErrorKind::Other, format!("control encoding failed: {e}"))
    })?;
    Ok(buf.to_vec())
}

fn integer(value: u32) -> Tag {
    Tag::Integer(Integer {
        inner: i64::from(value),
        ..Default::default()
    })
}

/// A control with no value.
pub fn flag(oid: &str) -> RawControl {
    RawControl {
        ctype: oid.to_string(),
        crit: true,
        val: None,
    }
}

/// Sort request for a single key.
pub fn sort_request(attribute: &str, ascending: bool) -> NativeResult<RawControl> {
    let mut key = vec![Tag::OctetString(OctetString {
        inner: attribute.as_bytes().to_vec(),
        ..Default::default()
    })];
    if !ascending {
        // reverseOrder [1] BOOLEAN
        key.push(Tag::Boolean(Boolean {
            class: TagClass::Context,
            id: 1,
            inner: true,
        }));
    }
    let value = encode(Tag::Sequence(Sequence {
        inner: vec![Tag::Sequence(Sequence {
            inner: key,
            ..Default::default()
        })],
        ..Default::default()
    }))?;
    Ok(RawControl {
        ctype: SORT_REQUEST_OID.to_string(),
        crit: false,
        val: Some(value),
    })
}

/// VLV request for the window `before`/`after` around the 1-based `offset`.
/// A content count of 0 lets the server treat the offset as absolute.
pub fn vlv_request(before: u32, after: u32, offset: u32) -> NativeResult<RawControl> {
    let by_offset = Tag::Sequence(Sequence {
        class: TagClass::Context,
        id: 0,
        inner: vec![integer(offset), integer(0)],
    });
    let value = encode(Tag::Sequence(Sequence {
        inner: vec![integer(before), integer(after), by_offset],
        ..Default::default()
    }))?;
    Ok(RawControl {
        ctype: VLV_REQUEST_OID.to_string(),
        crit: true,
        val: Some(value),
    })
}

/// Simple paged results request. A size of 0 with a cookie abandons the search.
pub fn paged_request(size: u32, cookie: &[u8]) -> RawControl {
    PagedResults {
        size: i32::try_from(size).unwrap_or(i32::MAX),
        cookie: cookie.to_vec(),
    }
    .into()
}

/// Cookie of the paged results response control, if present.
pub fn paged_cookie(controls: &[Control]) -> Option<Vec<u8>> {
    controls.iter().find_map(|Control(kind, raw)| match kind {
        Some(ControlType::PagedResults) if raw.val.is_some() => {
            Some(raw.parse::<PagedResults>().cookie)
        }
        _ => None,
    })
}

/// Content count estimate from the VLV response control, if present.
pub fn vlv_content_count(controls: &[Control]) -> Option<i64> {
    controls
        .iter()
        .filter(|Control(_, raw)| raw.ctype == VLV_RESPONSE_OID)
        .find_map(|Control(_, raw)| decode_vlv_count(raw.val.as_deref()?))
}

// VirtualListViewResponse ::= SEQUENCE { targetPosition INTEGER,
//     contentCount INTEGER, virtualListViewResult ENUMERATED, ... }
fn decode_vlv_count(value: &[u8]) -> Option<i64> {
    let (_, tag) = parse_tag(value).ok()?;
    let mut parts = tag.expect_constructed()?.into_iter();
    let _target_position = parts.next()?;
    let count = parts
        .next()?
        .match_class(TagClass::Universal)?
        .match_id(Types::Integer as u64)?
        .expect_primitive()?;
    let (_, count) = parse_uint(&count).ok()?;
    i64::try_from(count).ok()
}
