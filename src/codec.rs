//! AgentX wire codec (RFC 2741 §5, §6).
//!
//! Every PDU declares its own byte order in the header flags; all 16-, 32-
//! and 64-bit integers in that PDU (header fields included) follow it.

use crate::{
    oid::{Oid, INTERNET_PREFIX, MAX_SUBIDS},
    pdu::*,
};

/// Errors produced while decoding AgentX PDUs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("PDU truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Unsupported AgentX version {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown PDU type {0}")]
    UnknownPduType(u8),
    #[error("Unknown varbind type {0}")]
    UnknownValueType(u16),
    #[error("OID has {0} sub-identifiers (max 128)")]
    OidTooLong(usize),
    #[error("Invalid close reason {0}")]
    InvalidCloseReason(u8),
    #[error("{0} trailing bytes after PDU payload")]
    TrailingBytes(usize),
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Writes AgentX primitives into a growable buffer in one byte order.
pub struct Encoder {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Encoder {
    pub fn new(order: ByteOrder) -> Self {
        Encoder {
            buf: Vec::new(),
            order,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::BigEndian => self.buf.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::LittleEndian => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::BigEndian => self.buf.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::LittleEndian => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn put_u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::BigEndian => self.buf.extend_from_slice(&v.to_be_bytes()),
            ByteOrder::LittleEndian => self.buf.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Encodes an OID per RFC 2741 §5.1.
    ///
    /// Format: n_subid(1) + prefix(1) + include(1) + reserved(1) +
    /// sub-identifiers(4 each). OIDs under 1.3.6.1.x (x in 1..=255) drop the
    /// first five sub-identifiers and carry x in the prefix byte.
    pub fn put_oid(&mut self, oid: &Oid, include: bool) {
        let subs = oid.as_slice();
        let (prefix, start) = if oid.has_internet_prefix() {
            (subs[4] as u8, 5)
        } else {
            (0u8, 0)
        };
        debug_assert!(subs.len() <= MAX_SUBIDS, "OID with {} sub-identifiers", subs.len());
        let end = subs.len().min(start + MAX_SUBIDS);
        self.put_u8((end - start) as u8);
        self.put_u8(prefix);
        self.put_u8(u8::from(include));
        self.put_u8(0);
        for &sub in &subs[start..end] {
            self.put_u32(sub);
        }
    }

    /// Encodes an octet string per RFC 2741 §5.3, padded to 4 bytes.
    pub fn put_octets(&mut self, s: &[u8]) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s);
        let pad = (4 - (s.len() % 4)) % 4;
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    fn put_context(&mut self, context: &Option<Vec<u8>>) {
        if let Some(ctx) = context {
            self.put_octets(ctx);
        }
    }

    /// Encodes a VarBind per RFC 2741 §5.4.
    pub fn put_varbind(&mut self, vb: &VarBind) {
        self.put_u16(vb.value.type_tag());
        self.put_u16(0);
        self.put_oid(&vb.oid, false);
        match &vb.value {
            VarBindValue::Integer(v) => self.put_u32(*v as u32),
            VarBindValue::Counter32(v) | VarBindValue::Gauge32(v) | VarBindValue::TimeTicks(v) => {
                self.put_u32(*v)
            }
            VarBindValue::Counter64(v) => self.put_u64(*v),
            VarBindValue::OctetString(v) | VarBindValue::Opaque(v) => self.put_octets(v),
            VarBindValue::IpAddress(v) => self.put_octets(v),
            VarBindValue::ObjectIdentifier(v) => self.put_oid(v, false),
            VarBindValue::Null
            | VarBindValue::Sequence
            | VarBindValue::NoSuchObject
            | VarBindValue::NoSuchInstance
            | VarBindValue::EndOfMibView => {}
        }
    }

    pub fn put_search_range(&mut self, range: &SearchRange) {
        self.put_oid(&range.start, range.include);
        self.put_oid(&range.end, false);
    }

    fn put_payload(&mut self, payload: &Payload) {
        match payload {
            Payload::Open {
                timeout,
                id,
                description,
            } => {
                self.put_u8(*timeout);
                self.buf.extend_from_slice(&[0, 0, 0]);
                self.put_oid(id, false);
                self.put_octets(description);
            }
            Payload::Close { reason } => {
                self.put_u8(reason.as_u8());
                self.buf.extend_from_slice(&[0, 0, 0]);
            }
            Payload::Register {
                context,
                timeout,
                priority,
                range_subid,
                subtree,
                upper_bound,
                ..
            } => {
                self.put_context(context);
                self.put_u8(*timeout);
                self.put_u8(*priority);
                self.put_u8(*range_subid);
                self.put_u8(0);
                self.put_oid(subtree, false);
                if *range_subid != 0 {
                    self.put_u32(upper_bound.unwrap_or(0));
                }
            }
            Payload::Unregister {
                context,
                priority,
                range_subid,
                subtree,
                upper_bound,
            } => {
                self.put_context(context);
                self.put_u8(0);
                self.put_u8(*priority);
                self.put_u8(*range_subid);
                self.put_u8(0);
                self.put_oid(subtree, false);
                if *range_subid != 0 {
                    self.put_u32(upper_bound.unwrap_or(0));
                }
            }
            Payload::Get { context, ranges } | Payload::GetNext { context, ranges } => {
                self.put_context(context);
                for range in ranges {
                    self.put_search_range(range);
                }
            }
            Payload::GetBulk {
                context,
                non_repeaters,
                max_repetitions,
                ranges,
            } => {
                self.put_context(context);
                self.put_u16(*non_repeaters);
                self.put_u16(*max_repetitions);
                for range in ranges {
                    self.put_search_range(range);
                }
            }
            Payload::TestSet { context, varbinds }
            | Payload::Notify { context, varbinds }
            | Payload::IndexAllocate {
                context, varbinds, ..
            }
            | Payload::IndexDeallocate { context, varbinds } => {
                self.put_context(context);
                for vb in varbinds {
                    self.put_varbind(vb);
                }
            }
            Payload::CommitSet | Payload::UndoSet | Payload::CleanupSet => {}
            Payload::Ping { context } => self.put_context(context),
            Payload::AddAgentCaps {
                context,
                id,
                description,
            } => {
                self.put_context(context);
                self.put_oid(id, false);
                self.put_octets(description);
            }
            Payload::RemoveAgentCaps { context, id } => {
                self.put_context(context);
                self.put_oid(id, false);
            }
            Payload::Response {
                sys_uptime,
                error,
                index,
                varbinds,
            } => {
                self.put_u32(*sys_uptime);
                self.put_u16(error.as_u16());
                self.put_u16(*index);
                for vb in varbinds {
                    self.put_varbind(vb);
                }
            }
        }
    }
}

/// Reads AgentX primitives from a byte slice in one byte order.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Decoder { buf, pos: 0, order }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        let raw = [b[0], b[1]];
        Ok(match self.order {
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
        })
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(match self.order {
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
        })
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(match self.order {
            ByteOrder::BigEndian => u64::from_be_bytes(raw),
            ByteOrder::LittleEndian => u64::from_le_bytes(raw),
        })
    }

    /// Decodes an OID, returning it with its include flag.
    pub fn get_oid(&mut self) -> Result<(Oid, bool), CodecError> {
        let n_subid = self.get_u8()? as usize;
        let prefix = self.get_u8()?;
        let include = self.get_u8()? != 0;
        let _reserved = self.get_u8()?;

        let total = n_subid + if prefix > 0 { 5 } else { 0 };
        if total > MAX_SUBIDS {
            return Err(CodecError::OidTooLong(total));
        }

        let mut subs = Vec::with_capacity(total);
        if prefix > 0 {
            subs.extend_from_slice(&INTERNET_PREFIX);
            subs.push(prefix as u32);
        }
        for _ in 0..n_subid {
            subs.push(self.get_u32()?);
        }
        Ok((Oid(subs), include))
    }

    pub fn get_octets(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.get_u32()? as usize;
        let data = self.take(len)?.to_vec();
        let pad = (4 - (len % 4)) % 4;
        self.take(pad)?;
        Ok(data)
    }

    pub fn get_varbind(&mut self) -> Result<VarBind, CodecError> {
        let tag = self.get_u16()?;
        let _reserved = self.get_u16()?;
        let (oid, _) = self.get_oid()?;
        let value = match tag {
            VARBIND_INTEGER => VarBindValue::Integer(self.get_u32()? as i32),
            VARBIND_OCTET_STRING => VarBindValue::OctetString(self.get_octets()?),
            VARBIND_NULL => VarBindValue::Null,
            VARBIND_OBJECT_IDENTIFIER => VarBindValue::ObjectIdentifier(self.get_oid()?.0),
            VARBIND_IP_ADDRESS => {
                let raw = self.get_octets()?;
                let addr: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
                    CodecError::Malformed(format!("IpAddress of {} bytes", raw.len()))
                })?;
                VarBindValue::IpAddress(addr)
            }
            VARBIND_COUNTER32 => VarBindValue::Counter32(self.get_u32()?),
            VARBIND_GAUGE32 => VarBindValue::Gauge32(self.get_u32()?),
            VARBIND_TIMETICKS => VarBindValue::TimeTicks(self.get_u32()?),
            VARBIND_OPAQUE => VarBindValue::Opaque(self.get_octets()?),
            VARBIND_COUNTER64 => VarBindValue::Counter64(self.get_u64()?),
            VARBIND_SEQUENCE => VarBindValue::Sequence,
            VARBIND_NO_SUCH_OBJECT => VarBindValue::NoSuchObject,
            VARBIND_NO_SUCH_INSTANCE => VarBindValue::NoSuchInstance,
            VARBIND_END_OF_MIB_VIEW => VarBindValue::EndOfMibView,
            other => return Err(CodecError::UnknownValueType(other)),
        };
        Ok(VarBind { oid, value })
    }

    /// Decodes a SearchRange per RFC 2741 §5.2.
    pub fn get_search_range(&mut self) -> Result<SearchRange, CodecError> {
        let (start, include) = self.get_oid()?;
        let (end, _) = self.get_oid()?;
        Ok(SearchRange {
            start,
            end,
            include,
        })
    }

    fn get_varbinds(&mut self) -> Result<Vec<VarBind>, CodecError> {
        let mut varbinds = Vec::new();
        while self.remaining() > 0 {
            varbinds.push(self.get_varbind()?);
        }
        Ok(varbinds)
    }

    fn get_search_ranges(&mut self) -> Result<Vec<SearchRange>, CodecError> {
        let mut ranges = Vec::new();
        while self.remaining() > 0 {
            ranges.push(self.get_search_range()?);
        }
        Ok(ranges)
    }

    fn get_context(&mut self, flags: u8) -> Result<Option<Vec<u8>>, CodecError> {
        if flags & FLAG_NON_DEFAULT_CONTEXT != 0 {
            Ok(Some(self.get_octets()?))
        } else {
            Ok(None)
        }
    }
}

fn header_flags(pdu: &Pdu) -> u8 {
    let mut flags = pdu.byte_order.flag();
    if pdu.payload.context().is_some() {
        flags |= FLAG_NON_DEFAULT_CONTEXT;
    }
    match &pdu.payload {
        Payload::Register { instance: true, .. } => flags |= FLAG_INSTANCE_REGISTRATION,
        Payload::IndexAllocate {
            new_index,
            any_index,
            ..
        } => {
            if *new_index {
                flags |= FLAG_NEW_INDEX;
            }
            if *any_index {
                flags |= FLAG_ANY_INDEX;
            }
        }
        _ => {}
    }
    flags
}

/// Encodes a complete AgentX PDU (header + payload).
pub fn encode_pdu(pdu: &Pdu) -> Vec<u8> {
    let mut body = Encoder::new(pdu.byte_order);
    body.put_payload(&pdu.payload);
    let payload = body.into_inner();

    let mut out = Encoder::new(pdu.byte_order);
    out.put_u8(AGENTX_VERSION);
    out.put_u8(pdu.pdu_type().as_u8());
    out.put_u8(header_flags(pdu));
    out.put_u8(0); // reserved
    out.put_u32(pdu.session_id);
    out.put_u32(pdu.transaction_id);
    out.put_u32(pdu.packet_id);
    out.put_u32(payload.len() as u32);
    let mut buf = out.into_inner();
    buf.extend_from_slice(&payload);
    buf
}

/// Decodes an AgentX PDU header from the first 20 bytes of `buf`.
pub fn decode_header(buf: &[u8]) -> Result<PduHeader, CodecError> {
    if buf.len() < PDU_HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: PDU_HEADER_SIZE,
            available: buf.len(),
        });
    }
    let version = buf[0];
    if version != AGENTX_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let flags = buf[2];
    let mut d = Decoder::new(&buf[4..PDU_HEADER_SIZE], ByteOrder::from_flags(flags));
    Ok(PduHeader {
        version,
        pdu_type: buf[1],
        flags,
        session_id: d.get_u32()?,
        transaction_id: d.get_u32()?,
        packet_id: d.get_u32()?,
        payload_length: d.get_u32()?,
    })
}

/// Returns the total size of the PDU starting at `buf`, once its header is
/// available.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.len() < PDU_HEADER_SIZE {
        return Ok(None);
    }
    let header = decode_header(buf)?;
    Ok(Some(PDU_HEADER_SIZE + header.payload_length as usize))
}

/// Decodes the payload belonging to `header`. `payload` must be exactly
/// the declared payload bytes.
pub fn decode_payload(header: &PduHeader, payload: &[u8]) -> Result<Pdu, CodecError> {
    if payload.len() < header.payload_length as usize {
        return Err(CodecError::Truncated {
            needed: header.payload_length as usize,
            available: payload.len(),
        });
    }
    let payload = &payload[..header.payload_length as usize];
    let pdu_type =
        PduType::from_u8(header.pdu_type).ok_or(CodecError::UnknownPduType(header.pdu_type))?;
    let flags = header.flags;
    let mut d = Decoder::new(payload, header.byte_order());

    let body = match pdu_type {
        PduType::Open => {
            let timeout = d.get_u8()?;
            d.take(3)?;
            let (id, _) = d.get_oid()?;
            let description = d.get_octets()?;
            Payload::Open {
                timeout,
                id,
                description,
            }
        }
        PduType::Close => {
            let raw = d.get_u8()?;
            d.take(3)?;
            let reason = CloseReason::from_u8(raw).ok_or(CodecError::InvalidCloseReason(raw))?;
            Payload::Close { reason }
        }
        PduType::Register => {
            let context = d.get_context(flags)?;
            let timeout = d.get_u8()?;
            let priority = d.get_u8()?;
            let range_subid = d.get_u8()?;
            let _reserved = d.get_u8()?;
            let (subtree, _) = d.get_oid()?;
            let upper_bound = if range_subid != 0 {
                Some(d.get_u32()?)
            } else {
                None
            };
            Payload::Register {
                context,
                timeout,
                priority,
                range_subid,
                subtree,
                upper_bound,
                instance: flags & FLAG_INSTANCE_REGISTRATION != 0,
            }
        }
        PduType::Unregister => {
            let context = d.get_context(flags)?;
            let _reserved = d.get_u8()?;
            let priority = d.get_u8()?;
            let range_subid = d.get_u8()?;
            let _reserved = d.get_u8()?;
            let (subtree, _) = d.get_oid()?;
            let upper_bound = if range_subid != 0 {
                Some(d.get_u32()?)
            } else {
                None
            };
            Payload::Unregister {
                context,
                priority,
                range_subid,
                subtree,
                upper_bound,
            }
        }
        PduType::Get => Payload::Get {
            context: d.get_context(flags)?,
            ranges: d.get_search_ranges()?,
        },
        PduType::GetNext => Payload::GetNext {
            context: d.get_context(flags)?,
            ranges: d.get_search_ranges()?,
        },
        PduType::GetBulk => Payload::GetBulk {
            context: d.get_context(flags)?,
            non_repeaters: d.get_u16()?,
            max_repetitions: d.get_u16()?,
            ranges: d.get_search_ranges()?,
        },
        PduType::TestSet => Payload::TestSet {
            context: d.get_context(flags)?,
            varbinds: d.get_varbinds()?,
        },
        PduType::CommitSet => Payload::CommitSet,
        PduType::UndoSet => Payload::UndoSet,
        PduType::CleanupSet => Payload::CleanupSet,
        PduType::Notify => Payload::Notify {
            context: d.get_context(flags)?,
            varbinds: d.get_varbinds()?,
        },
        PduType::Ping => Payload::Ping {
            context: d.get_context(flags)?,
        },
        PduType::IndexAllocate => Payload::IndexAllocate {
            context: d.get_context(flags)?,
            new_index: flags & FLAG_NEW_INDEX != 0,
            any_index: flags & FLAG_ANY_INDEX != 0,
            varbinds: d.get_varbinds()?,
        },
        PduType::IndexDeallocate => Payload::IndexDeallocate {
            context: d.get_context(flags)?,
            varbinds: d.get_varbinds()?,
        },
        PduType::AddAgentCaps => {
            let context = d.get_context(flags)?;
            let (id, _) = d.get_oid()?;
            let description = d.get_octets()?;
            Payload::AddAgentCaps {
                context,
                id,
                description,
            }
        }
        PduType::RemoveAgentCaps => {
            let context = d.get_context(flags)?;
            let (id, _) = d.get_oid()?;
            Payload::RemoveAgentCaps { context, id }
        }
        PduType::Response => {
            let sys_uptime = d.get_u32()?;
            let error = ErrorStatus::from_u16(d.get_u16()?);
            let index = d.get_u16()?;
            Payload::Response {
                sys_uptime,
                error,
                index,
                varbinds: d.get_varbinds()?,
            }
        }
    };

    if d.remaining() > 0 {
        return Err(CodecError::TrailingBytes(d.remaining()));
    }

    Ok(Pdu {
        session_id: header.session_id,
        transaction_id: header.transaction_id,
        packet_id: header.packet_id,
        byte_order: header.byte_order(),
        payload: body,
    })
}

/// Decodes one complete PDU from the front of `buf`, returning it with the
/// number of bytes consumed.
pub fn decode_pdu(buf: &[u8]) -> Result<(Pdu, usize), CodecError> {
    let header = decode_header(buf)?;
    let total = PDU_HEADER_SIZE + header.payload_length as usize;
    if buf.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            available: buf.len(),
        });
    }
    let pdu = decode_payload(&header, &buf[PDU_HEADER_SIZE..total])?;
    Ok((pdu, total))
}

/// Number of bytes `vb` occupies on the wire.
pub fn varbind_encoded_len(vb: &VarBind) -> usize {
    let mut enc = Encoder::new(ByteOrder::BigEndian);
    enc.put_varbind(vb);
    enc.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) {
        for order in [ByteOrder::BigEndian, ByteOrder::LittleEndian] {
            let pdu = Pdu {
                session_id: 42,
                transaction_id: 7,
                packet_id: 99,
                byte_order: order,
                payload: payload.clone(),
            };
            let bytes = encode_pdu(&pdu);
            assert_eq!(bytes.len() % 4, 0, "PDU must stay 4-byte aligned");
            let (decoded, consumed) = decode_pdu(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, pdu);
        }
    }

    fn internet_oid() -> Oid {
        Oid::from_slice(&[1, 3, 6, 1, 4, 1, 99999, 1, 2])
    }

    fn plain_oid() -> Oid {
        Oid::from_slice(&[1, 2, 3])
    }

    fn sample_varbinds() -> Vec<VarBind> {
        vec![
            VarBind::new(internet_oid(), VarBindValue::Integer(-5)),
            VarBind::new(plain_oid(), VarBindValue::OctetString(b"a".to_vec())),
            VarBind::new(internet_oid(), VarBindValue::OctetString(b"ab".to_vec())),
            VarBind::new(internet_oid(), VarBindValue::OctetString(b"abc".to_vec())),
            VarBind::new(internet_oid(), VarBindValue::OctetString(b"abcd".to_vec())),
            VarBind::new(internet_oid(), VarBindValue::Null),
            VarBind::new(internet_oid(), VarBindValue::ObjectIdentifier(plain_oid())),
            VarBind::new(internet_oid(), VarBindValue::IpAddress([10, 0, 0, 1])),
            VarBind::new(internet_oid(), VarBindValue::Counter32(7)),
            VarBind::new(internet_oid(), VarBindValue::Gauge32(8)),
            VarBind::new(internet_oid(), VarBindValue::TimeTicks(9)),
            VarBind::new(internet_oid(), VarBindValue::Opaque(vec![1, 2, 3, 4, 5])),
            VarBind::new(internet_oid(), VarBindValue::Counter64(0x0102_0304_0506_0708)),
            VarBind::new(internet_oid(), VarBindValue::Sequence),
            VarBind::new(internet_oid(), VarBindValue::NoSuchObject),
            VarBind::new(internet_oid(), VarBindValue::NoSuchInstance),
            VarBind::new(internet_oid(), VarBindValue::EndOfMibView),
        ]
    }

    fn sample_ranges() -> Vec<SearchRange> {
        vec![
            SearchRange::new(internet_oid(), Some(Oid::from_slice(&[1, 3, 6, 1, 5])), true),
            SearchRange::new(plain_oid(), None, false),
        ]
    }

    #[test]
    fn test_roundtrip_every_pdu_type() {
        let ctx = Some(b"ctx".to_vec());
        roundtrip(Payload::Open {
            timeout: 30,
            id: internet_oid(),
            description: b"subagent".to_vec(),
        });
        roundtrip(Payload::Close {
            reason: CloseReason::Shutdown,
        });
        roundtrip(Payload::Register {
            context: ctx.clone(),
            timeout: 5,
            priority: 127,
            range_subid: 7,
            subtree: internet_oid(),
            upper_bound: Some(22),
            instance: true,
        });
        roundtrip(Payload::Register {
            context: None,
            timeout: 0,
            priority: 1,
            range_subid: 0,
            subtree: plain_oid(),
            upper_bound: None,
            instance: false,
        });
        roundtrip(Payload::Unregister {
            context: ctx.clone(),
            priority: 127,
            range_subid: 0,
            subtree: internet_oid(),
            upper_bound: None,
        });
        roundtrip(Payload::Get {
            context: None,
            ranges: sample_ranges(),
        });
        roundtrip(Payload::GetNext {
            context: ctx.clone(),
            ranges: sample_ranges(),
        });
        roundtrip(Payload::GetBulk {
            context: None,
            non_repeaters: 1,
            max_repetitions: 10,
            ranges: sample_ranges(),
        });
        roundtrip(Payload::TestSet {
            context: ctx.clone(),
            varbinds: sample_varbinds(),
        });
        roundtrip(Payload::CommitSet);
        roundtrip(Payload::UndoSet);
        roundtrip(Payload::CleanupSet);
        roundtrip(Payload::Notify {
            context: None,
            varbinds: sample_varbinds(),
        });
        roundtrip(Payload::Ping {
            context: ctx.clone(),
        });
        roundtrip(Payload::IndexAllocate {
            context: None,
            new_index: true,
            any_index: false,
            varbinds: vec![VarBind::new(internet_oid(), VarBindValue::Integer(0))],
        });
        roundtrip(Payload::IndexDeallocate {
            context: ctx.clone(),
            varbinds: vec![VarBind::new(internet_oid(), VarBindValue::Integer(3))],
        });
        roundtrip(Payload::AddAgentCaps {
            context: None,
            id: internet_oid(),
            description: b"caps".to_vec(),
        });
        roundtrip(Payload::RemoveAgentCaps {
            context: ctx,
            id: internet_oid(),
        });
        roundtrip(Payload::Response {
            sys_uptime: 12345,
            error: ErrorStatus::NoError,
            index: 0,
            varbinds: sample_varbinds(),
        });
    }

    #[test]
    fn test_oid_prefix_compression() {
        let mut enc = Encoder::new(ByteOrder::BigEndian);
        enc.put_oid(&Oid::from_slice(&[1, 3, 6, 1, 4, 1, 99999]), true);
        let bytes = enc.into_inner();
        assert_eq!(bytes[0], 2); // n_subid: 1, 99999
        assert_eq!(bytes[1], 4); // prefix
        assert_eq!(bytes[2], 1); // include
        assert_eq!(bytes.len(), 4 + 2 * 4);

        let mut enc = Encoder::new(ByteOrder::BigEndian);
        enc.put_oid(&Oid::from_slice(&[1, 3, 6, 1]), false);
        let bytes = enc.into_inner();
        assert_eq!(bytes[0], 4);
        assert_eq!(bytes[1], 0);
    }

    #[test]
    fn test_null_oid_encoding() {
        let mut enc = Encoder::new(ByteOrder::LittleEndian);
        enc.put_oid(&Oid::null(), false);
        assert_eq!(enc.into_inner(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_octet_string_padding() {
        for (len, expected) in [(0usize, 4usize), (1, 8), (2, 8), (3, 8), (4, 8), (5, 12)] {
            let mut enc = Encoder::new(ByteOrder::BigEndian);
            enc.put_octets(&vec![0xAA; len]);
            assert_eq!(enc.len(), expected, "length {}", len);
        }
    }

    #[test]
    fn test_header_byte_order() {
        let pdu = Pdu {
            session_id: 0x0102_0304,
            transaction_id: 0,
            packet_id: 0,
            byte_order: ByteOrder::LittleEndian,
            payload: Payload::CommitSet,
        };
        let bytes = encode_pdu(&pdu);
        assert_eq!(bytes[2] & FLAG_NETWORK_BYTE_ORDER, 0);
        assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);

        let pdu = Pdu {
            byte_order: ByteOrder::BigEndian,
            ..pdu
        };
        let bytes = encode_pdu(&pdu);
        assert_ne!(bytes[2] & FLAG_NETWORK_BYTE_ORDER, 0);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_context_flag_set_only_with_context() {
        let with_ctx = Pdu::new(
            1,
            0,
            0,
            Payload::Ping {
                context: Some(b"x".to_vec()),
            },
        );
        let bytes = encode_pdu(&with_ctx);
        assert_ne!(bytes[2] & FLAG_NON_DEFAULT_CONTEXT, 0);

        let without = Pdu::new(1, 0, 0, Payload::Ping { context: None });
        let bytes = encode_pdu(&without);
        assert_eq!(bytes[2] & FLAG_NON_DEFAULT_CONTEXT, 0);
    }

    #[test]
    fn test_rejects_short_pdu() {
        let pdu = Pdu::new(
            1,
            2,
            3,
            Payload::Close {
                reason: CloseReason::Other,
            },
        );
        let bytes = encode_pdu(&pdu);
        let short = &bytes[..bytes.len() - 1];
        assert!(matches!(
            decode_pdu(short),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            decode_header(&bytes[..10]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_version_and_type() {
        let pdu = Pdu::new(1, 2, 3, Payload::CommitSet);
        let mut bytes = encode_pdu(&pdu);
        bytes[0] = 2;
        assert_eq!(
            decode_header(&bytes).unwrap_err(),
            CodecError::UnsupportedVersion(2)
        );

        let mut bytes = encode_pdu(&pdu);
        bytes[1] = 99;
        assert_eq!(
            decode_pdu(&bytes).unwrap_err(),
            CodecError::UnknownPduType(99)
        );
    }

    #[test]
    fn test_rejects_trailing_bytes_in_fixed_payload() {
        let pdu = Pdu::new(
            1,
            0,
            0,
            Payload::Close {
                reason: CloseReason::Other,
            },
        );
        let mut bytes = encode_pdu(&pdu);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes[19] = 8; // big-endian payload length
        assert_eq!(
            decode_pdu(&bytes).unwrap_err(),
            CodecError::TrailingBytes(4)
        );
    }

    #[test]
    fn test_frame_length() {
        let pdu = Pdu::new(1, 0, 0, Payload::Ping { context: None });
        let bytes = encode_pdu(&pdu);
        assert_eq!(frame_length(&bytes[..5]).unwrap(), None);
        assert_eq!(frame_length(&bytes).unwrap(), Some(bytes.len()));
    }

    #[test]
    fn test_varbind_encoded_len() {
        let vb = VarBind::new(internet_oid(), VarBindValue::Integer(1));
        // type(2) + reserved(2) + oid(4 + 4*4) + value(4)
        assert_eq!(varbind_encoded_len(&vb), 4 + 20 + 4);
    }
}
