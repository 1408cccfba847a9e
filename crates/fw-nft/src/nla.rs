// Netlink attribute (TLV) encoding and decoding for nf_tables messages
use thiserror::Error;

const NLA_F_NESTED: u16 = 1 << 15;
const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;

pub(crate) const NFTA_LIST_ELEM: u16 = 1;
pub(crate) const NFTA_EXPR_NAME: u16 = 1;
pub(crate) const NFTA_EXPR_DATA: u16 = 2;
pub(crate) const NFTA_DATA_VALUE: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("missing attribute {0}")]
    Missing(&'static str),

    #[error("malformed attribute {0}")]
    Malformed(&'static str),
}

pub(crate) fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

pub(crate) fn push_attr_bytes(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let len = NLA_HDRLEN + data.len();
    let aligned = nla_align(len);
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    if aligned > len {
        buf.resize(buf.len() + (aligned - len), 0);
    }
}

pub(crate) fn push_attr_nested(buf: &mut Vec<u8>, attr_type: u16, build: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; NLA_HDRLEN]);
    build(buf);
    let len = buf.len() - start;
    let attr_type = attr_type | NLA_F_NESTED;
    buf[start..start + 2].copy_from_slice(&(len as u16).to_ne_bytes());
    buf[start + 2..start + 4].copy_from_slice(&attr_type.to_ne_bytes());
    let aligned = nla_align(len);
    if aligned > len {
        buf.resize(buf.len() + (aligned - len), 0);
    }
}

pub(crate) fn push_attr_str(buf: &mut Vec<u8>, attr_type: u16, value: &str) {
    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);
    push_attr_bytes(buf, attr_type, &bytes);
}

/// nf_tables integer attributes travel in network byte order
pub(crate) fn push_attr_u32(buf: &mut Vec<u8>, attr_type: u16, value: u32) {
    push_attr_bytes(buf, attr_type, &value.to_be_bytes());
}

pub(crate) fn push_attr_u64(buf: &mut Vec<u8>, attr_type: u16, value: u64) {
    push_attr_bytes(buf, attr_type, &value.to_be_bytes());
}

pub(crate) fn push_attr_u8(buf: &mut Vec<u8>, attr_type: u16, value: u8) {
    push_attr_bytes(buf, attr_type, &[value]);
}

/// Wrap one expression as `NFTA_LIST_ELEM { NFTA_EXPR_NAME, NFTA_EXPR_DATA }`
pub(crate) fn append_expr(exprs: &mut Vec<u8>, name: &str, build: impl FnOnce(&mut Vec<u8>)) {
    push_attr_nested(exprs, NFTA_LIST_ELEM, |elem| {
        push_attr_str(elem, NFTA_EXPR_NAME, name);
        push_attr_nested(elem, NFTA_EXPR_DATA, build);
    });
}

/// Attributes of one message or nest, flags stripped from the types
#[derive(Debug, Clone, Default)]
pub(crate) struct Attrs<'a> {
    attrs: Vec<(u16, &'a [u8])>,
}

impl<'a> Attrs<'a> {
    pub(crate) fn parse(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let mut attrs = Vec::new();
        let mut offset = 0usize;

        while offset + NLA_HDRLEN <= buf.len() {
            let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
            let attr_type = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]])
                & !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);
            if len < NLA_HDRLEN || offset + len > buf.len() {
                return Err(DecodeError::Truncated("attribute"));
            }
            attrs.push((attr_type, &buf[offset + NLA_HDRLEN..offset + len]));
            offset += nla_align(len);
        }

        Ok(Self { attrs })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u16, &'a [u8])> + '_ {
        self.attrs.iter().copied()
    }

    pub(crate) fn get(&self, attr_type: u16) -> Option<&'a [u8]> {
        self.attrs
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, payload)| *payload)
    }

    pub(crate) fn has(&self, attr_type: u16) -> bool {
        self.get(attr_type).is_some()
    }

    pub(crate) fn bytes(&self, attr_type: u16, what: &'static str) -> Result<&'a [u8], DecodeError> {
        self.get(attr_type).ok_or(DecodeError::Missing(what))
    }

    pub(crate) fn u32(&self, attr_type: u16, what: &'static str) -> Result<u32, DecodeError> {
        self.opt_u32(attr_type, what)?
            .ok_or(DecodeError::Missing(what))
    }

    pub(crate) fn opt_u32(&self, attr_type: u16, what: &'static str) -> Result<Option<u32>, DecodeError> {
        self.get(attr_type)
            .map(|payload| {
                <[u8; 4]>::try_from(payload)
                    .map(u32::from_be_bytes)
                    .map_err(|_| DecodeError::Malformed(what))
            })
            .transpose()
    }

    pub(crate) fn u64(&self, attr_type: u16, what: &'static str) -> Result<u64, DecodeError> {
        let payload = self.bytes(attr_type, what)?;
        <[u8; 8]>::try_from(payload)
            .map(u64::from_be_bytes)
            .map_err(|_| DecodeError::Malformed(what))
    }

    pub(crate) fn u8(&self, attr_type: u16, what: &'static str) -> Result<u8, DecodeError> {
        match self.bytes(attr_type, what)? {
            [value, ..] => Ok(*value),
            [] => Err(DecodeError::Malformed(what)),
        }
    }

    /// NUL-terminated string attribute
    pub(crate) fn string(&self, attr_type: u16, what: &'static str) -> Result<String, DecodeError> {
        let payload = self.bytes(attr_type, what)?;
        let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
        std::str::from_utf8(&payload[..end])
            .map(str::to_string)
            .map_err(|_| DecodeError::Malformed(what))
    }

    pub(crate) fn nested(&self, attr_type: u16, what: &'static str) -> Result<Attrs<'a>, DecodeError> {
        Attrs::parse(self.bytes(attr_type, what)?)
    }
}
