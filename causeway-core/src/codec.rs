//! Versioned binary event format.
//!
//! All integers are little-endian.
//!
//! ```text
//! header     id:u64  timestamp:u64  source_id:u64  kind_tag:u8  version:u8   (26 bytes)
//! extension  node_tag:u16  flags:u8  links:u8  [correlation_id:u64]  [parent_id:u64]
//! body       per-kind fields
//! payload    len:u32  bytes
//! ```
//!
//! Strings are `len:u16` + UTF-8 (at most `MAX_NAME_LEN` bytes). Digests are
//! `original_len:u32` + `len:u16` + bytes. Durations are u64 nanoseconds.
//!
//! Encoding never truncates: oversized fields are an error. Callers apply
//! `Event::truncate_to` first.

use crate::digest::{Digest, MAX_DIGEST_LEN};
use crate::error::CodecError;
use crate::event::{CaptureLimits, Event, EventFlags, EventKind, KindTag, MAX_NAME_LEN};
use crate::{CorrelationId, EventId, NodeTag, SourceId, Timestamp};
use std::time::Duration;

/// Current wire format version.
pub const FORMAT_VERSION: u8 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 26;

const EXT_FIXED_LEN: usize = 4;
const LINK_CORRELATION: u8 = 0b01;
const LINK_PARENT: u8 = 0b10;

const NAME_OVERHEAD: usize = 2;
const DIGEST_OVERHEAD: usize = 6;
const PAYLOAD_OVERHEAD: usize = 4;

// ============================================================================
// SIZING
// ============================================================================

/// Exact encoded size of `event`.
pub fn encoded_len(event: &Event) -> usize {
    let mut len = HEADER_LEN + EXT_FIXED_LEN;
    if event.correlation_id.is_some() {
        len += 8;
    }
    if event.parent_id.is_some() {
        len += 8;
    }
    len + body_len(&event.kind) + PAYLOAD_OVERHEAD + event.payload.len()
}

fn body_len(kind: &EventKind) -> usize {
    let name = |s: &String| NAME_OVERHEAD + s.len();
    let digest = |d: &Digest| DIGEST_OVERHEAD + d.bytes.len();
    match kind {
        EventKind::FunctionEntry {
            module,
            function,
            args_digest,
            ..
        } => 8 + name(module) + name(function) + 1 + digest(args_digest),
        EventKind::FunctionExit { result_digest, .. } => 8 + digest(result_digest) + 8,
        EventKind::StateChange {
            callback,
            state_before_digest,
            state_after_digest,
        } => name(callback) + digest(state_before_digest) + digest(state_after_digest),
        EventKind::MessageSend { payload_digest, .. }
        | EventKind::MessageReceive { payload_digest, .. } => 8 + 8 + digest(payload_digest),
        EventKind::UnitSpawn { .. } => 16,
        EventKind::UnitExit { reason_digest } => digest(reason_digest),
    }
}

/// Upper bound on the encoded size of any event truncated to `limits`.
pub fn max_encoded_len(limits: &CaptureLimits) -> usize {
    let digest = DIGEST_OVERHEAD + limits.digest_budget.min(MAX_DIGEST_LEN);
    let name = NAME_OVERHEAD + MAX_NAME_LEN;
    let body = [
        8 + name + name + 1 + digest,
        8 + digest + 8,
        name + digest + digest,
        8 + 8 + digest,
        16,
        digest,
    ]
    .into_iter()
    .max()
    .unwrap_or(0);
    HEADER_LEN + EXT_FIXED_LEN + 16 + body + PAYLOAD_OVERHEAD + limits.payload_budget
}

// ============================================================================
// ENCODING
// ============================================================================

/// Encode `event` into a freshly allocated buffer.
pub fn encode(event: &Event) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; encoded_len(event)];
    let written = encode_into(event, &mut buf)?;
    buf.truncate(written);
    Ok(buf)
}

/// Encode `event` into `buf` without allocating. Returns bytes written.
pub fn encode_into(event: &Event, buf: &mut [u8]) -> Result<usize, CodecError> {
    let needed = encoded_len(event);
    if needed > buf.len() {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }

    let mut w = Writer { buf, pos: 0 };
    w.u64(event.id.0);
    w.u64(event.timestamp.0);
    w.u64(event.source_id.0);
    w.u8(event.kind.tag().as_u8());
    w.u8(FORMAT_VERSION);

    w.u16(event.node_tag.0);
    w.u8(event.flags.bits());
    let mut links = 0u8;
    if event.correlation_id.is_some() {
        links |= LINK_CORRELATION;
    }
    if event.parent_id.is_some() {
        links |= LINK_PARENT;
    }
    w.u8(links);
    if let Some(c) = event.correlation_id {
        w.u64(c.0);
    }
    if let Some(p) = event.parent_id {
        w.u64(p.0);
    }

    match &event.kind {
        EventKind::FunctionEntry {
            call_id,
            module,
            function,
            arity,
            args_digest,
        } => {
            w.u64(*call_id);
            w.name("module", module)?;
            w.name("function", function)?;
            w.u8(*arity);
            w.digest("args_digest", args_digest)?;
        }
        EventKind::FunctionExit {
            call_id,
            result_digest,
            duration,
        } => {
            w.u64(*call_id);
            w.digest("result_digest", result_digest)?;
            w.u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX));
        }
        EventKind::StateChange {
            callback,
            state_before_digest,
            state_after_digest,
        } => {
            w.name("callback", callback)?;
            w.digest("state_before_digest", state_before_digest)?;
            w.digest("state_after_digest", state_after_digest)?;
        }
        EventKind::MessageSend {
            message_id,
            to_source_id,
            payload_digest,
        } => {
            w.u64(*message_id);
            w.u64(to_source_id.0);
            w.digest("payload_digest", payload_digest)?;
        }
        EventKind::MessageReceive {
            message_id,
            from_source_id,
            payload_digest,
        } => {
            w.u64(*message_id);
            w.u64(from_source_id.0);
            w.digest("payload_digest", payload_digest)?;
        }
        EventKind::UnitSpawn {
            parent_source_id,
            child_source_id,
        } => {
            w.u64(parent_source_id.0);
            w.u64(child_source_id.0);
        }
        EventKind::UnitExit { reason_digest } => {
            w.digest("reason_digest", reason_digest)?;
        }
    }

    let payload_len = u32::try_from(event.payload.len()).map_err(|_| CodecError::FieldTooLong {
        field: "payload",
        len: event.payload.len(),
        limit: u32::MAX as usize,
    })?;
    w.u32(payload_len);
    w.bytes(&event.payload);

    Ok(w.pos)
}

/// Cursor over an output slice already checked to be large enough.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    #[inline]
    fn bytes(&mut self, src: &[u8]) {
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
    }

    #[inline]
    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    #[inline]
    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    #[inline]
    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    #[inline]
    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn name(&mut self, field: &'static str, s: &str) -> Result<(), CodecError> {
        if s.len() > MAX_NAME_LEN {
            return Err(CodecError::FieldTooLong {
                field,
                len: s.len(),
                limit: MAX_NAME_LEN,
            });
        }
        self.u16(s.len() as u16);
        self.bytes(s.as_bytes());
        Ok(())
    }

    fn digest(&mut self, field: &'static str, d: &Digest) -> Result<(), CodecError> {
        if d.bytes.len() > MAX_DIGEST_LEN {
            return Err(CodecError::FieldTooLong {
                field,
                len: d.bytes.len(),
                limit: MAX_DIGEST_LEN,
            });
        }
        self.u32(d.original_len);
        self.u16(d.bytes.len() as u16);
        self.bytes(&d.bytes);
        Ok(())
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Decode exactly one event from `buf`.
pub fn decode(buf: &[u8]) -> Result<Event, CodecError> {
    let mut r = Reader { buf, pos: 0 };

    let id = EventId(r.u64()?);
    let timestamp = Timestamp(r.u64()?);
    let source_id = SourceId(r.u64()?);
    let tag_byte = r.u8()?;
    let version = r.u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let tag = KindTag::from_u8(tag_byte).ok_or(CodecError::UnknownKind(tag_byte))?;

    let node_tag = NodeTag(r.u16()?);
    let flag_bits = r.u8()?;
    let flags = EventFlags::from_bits(flag_bits).ok_or(CodecError::InvalidFlags(flag_bits))?;
    let links = r.u8()?;
    let correlation_id = if links & LINK_CORRELATION != 0 {
        Some(CorrelationId(r.u64()?))
    } else {
        None
    };
    let parent_id = if links & LINK_PARENT != 0 {
        Some(EventId(r.u64()?))
    } else {
        None
    };

    let kind = match tag {
        KindTag::FunctionEntry => EventKind::FunctionEntry {
            call_id: r.u64()?,
            module: r.name("module")?,
            function: r.name("function")?,
            arity: r.u8()?,
            args_digest: r.digest()?,
        },
        KindTag::FunctionExit => EventKind::FunctionExit {
            call_id: r.u64()?,
            result_digest: r.digest()?,
            duration: Duration::from_nanos(r.u64()?),
        },
        KindTag::StateChange => EventKind::StateChange {
            callback: r.name("callback")?,
            state_before_digest: r.digest()?,
            state_after_digest: r.digest()?,
        },
        KindTag::MessageSend => EventKind::MessageSend {
            message_id: r.u64()?,
            to_source_id: SourceId(r.u64()?),
            payload_digest: r.digest()?,
        },
        KindTag::MessageReceive => EventKind::MessageReceive {
            message_id: r.u64()?,
            from_source_id: SourceId(r.u64()?),
            payload_digest: r.digest()?,
        },
        KindTag::UnitSpawn => EventKind::UnitSpawn {
            parent_source_id: SourceId(r.u64()?),
            child_source_id: SourceId(r.u64()?),
        },
        KindTag::UnitExit => EventKind::UnitExit {
            reason_digest: r.digest()?,
        },
    };

    let payload_len = r.u32()? as usize;
    let payload = r.take(payload_len)?.to_vec();

    let rest = buf.len() - r.pos;
    if rest != 0 {
        return Err(CodecError::TrailingBytes(rest));
    }

    Ok(Event {
        id,
        timestamp,
        source_id,
        node_tag,
        correlation_id,
        parent_id,
        flags,
        kind,
        payload,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn name(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        if len > MAX_NAME_LEN {
            return Err(CodecError::FieldTooLong {
                field,
                len,
                limit: MAX_NAME_LEN,
            });
        }
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8 { field })
    }

    fn digest(&mut self) -> Result<Digest, CodecError> {
        let original_len = self.u32()?;
        let len = self.u16()? as usize;
        Ok(Digest::from_parts(self.take(len)?.to_vec(), original_len))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<Event> {
        let src = SourceId(3);
        vec![
            Event::new(
                EventId(1),
                Timestamp(10),
                src,
                EventKind::function_entry(7, "cart", "add_item", 2, Digest::from("[sku, 1]")),
            )
            .with_payload(b"ctx".to_vec()),
            Event::new(
                EventId(2),
                Timestamp(20),
                src,
                EventKind::function_exit(7, Digest::from("ok"), Duration::from_nanos(1234)),
            ),
            Event::new(
                EventId(3),
                Timestamp(30),
                src,
                EventKind::state_change("handle_cast", Digest::from("{}"), Digest::hashed(b"{a}")),
            ),
            Event::new(
                EventId(4),
                Timestamp(40),
                src,
                EventKind::message_send(99, SourceId(4), Digest::from("ping")),
            ),
            Event::new(
                EventId(5),
                Timestamp(50),
                SourceId(4),
                EventKind::message_receive(99, src, Digest::from("ping")),
            ),
            Event::new(
                EventId(6),
                Timestamp(60),
                src,
                EventKind::unit_spawn(src, SourceId(9)),
            ),
            Event::new(
                EventId(7),
                Timestamp(70),
                SourceId(9),
                EventKind::unit_exit(Digest::from("shutdown")),
            ),
        ]
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for event in sample_events() {
            let bytes = encode(&event).unwrap();
            assert_eq!(bytes.len(), encoded_len(&event));
            assert_eq!(decode(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn test_roundtrip_with_links() {
        let mut event = sample_events().remove(1);
        event.correlate(Some(CorrelationId(1)), Some(EventId(1)));
        event.flags |= EventFlags::ORPHANED;
        let bytes = encode(&event).unwrap();
        assert_eq!(decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_header_layout() {
        let event = sample_events().remove(0);
        let bytes = encode(&event).unwrap();
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &10u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());
        assert_eq!(bytes[24], KindTag::FunctionEntry.as_u8());
        assert_eq!(bytes[25], FORMAT_VERSION);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = encode(&sample_events()[0]).unwrap();
        bytes[25] = 42;
        assert_eq!(
            decode(&bytes),
            Err(CodecError::UnsupportedVersion {
                found: 42,
                expected: FORMAT_VERSION
            })
        );
    }

    #[test]
    fn test_unknown_kind() {
        let mut bytes = encode(&sample_events()[0]).unwrap();
        bytes[24] = 200;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownKind(200)));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&sample_events()[0]).unwrap();
        for cut in [0, 5, HEADER_LEN, bytes.len() - 1] {
            assert!(matches!(
                decode(&bytes[..cut]),
                Err(CodecError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encode(&sample_events()[3]).unwrap();
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes(2)));
    }

    #[test]
    fn test_invalid_utf8() {
        let event = Event::new(
            EventId(1),
            Timestamp(1),
            SourceId(1),
            EventKind::state_change("ab", Digest::empty(), Digest::empty()),
        );
        let mut bytes = encode(&event).unwrap();
        // callback string starts right after header + extension + u16 length
        let at = HEADER_LEN + EXT_FIXED_LEN + 2;
        bytes[at] = 0xFF;
        assert_eq!(
            decode(&bytes),
            Err(CodecError::InvalidUtf8 { field: "callback" })
        );
    }

    #[test]
    fn test_encode_rejects_long_name() {
        let event = Event::new(
            EventId(1),
            Timestamp(1),
            SourceId(1),
            EventKind::function_entry(1, "m".repeat(MAX_NAME_LEN + 1), "f", 0, Digest::empty()),
        );
        assert!(matches!(
            encode(&event),
            Err(CodecError::FieldTooLong { field: "module", .. })
        ));
    }

    #[test]
    fn test_encode_into_small_buffer() {
        let event = sample_events().remove(0);
        let mut buf = [0u8; 8];
        assert!(matches!(
            encode_into(&event, &mut buf),
            Err(CodecError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_encode_into_larger_buffer() {
        let event = sample_events().remove(4);
        let mut buf = vec![0u8; 1024];
        let n = encode_into(&event, &mut buf).unwrap();
        assert_eq!(decode(&buf[..n]).unwrap(), event);
    }

    #[test]
    fn test_max_encoded_len_bounds_truncated_events() {
        let limits = CaptureLimits::new(64, 16);
        let big = Digest::capture(&[9u8; 500], 500);
        let mut events = vec![
            Event::new(
                EventId(1),
                Timestamp(1),
                SourceId(1),
                EventKind::function_entry(
                    1,
                    "m".repeat(400),
                    "f".repeat(400),
                    255,
                    big.clone(),
                ),
            ),
            Event::new(
                EventId(2),
                Timestamp(2),
                SourceId(1),
                EventKind::state_change("c".repeat(400), big.clone(), big),
            ),
        ];
        for event in &mut events {
            event.payload = vec![1u8; 500];
            event.correlate(Some(CorrelationId(1)), Some(EventId(1)));
            event.truncate_to(&limits);
            assert!(encoded_len(event) <= max_encoded_len(&limits));
            assert!(encode(event).is_ok());
        }
    }
}
