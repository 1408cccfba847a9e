// nf_tables expression model and its netlink marshaling
use serde::{Deserialize, Serialize};

use crate::nla::{
    Attrs, DecodeError, NFTA_DATA_VALUE, NFTA_EXPR_DATA, NFTA_EXPR_NAME, NFTA_LIST_ELEM,
    append_expr, push_attr_bytes, push_attr_nested, push_attr_str, push_attr_u32, push_attr_u64,
    push_attr_u8,
};

pub const NFT_REG_VERDICT: u32 = 0;
pub const NFT_REG_1: u32 = 1;
pub const NFT_REG_2: u32 = 2;

pub const NFPROTO_IPV4: u32 = 2;
pub const NFPROTO_IPV6: u32 = 10;

/// TCP option kind for the maximum segment size
pub const TCPOPT_MAXSEG: u8 = 2;

const NFTA_DATA_VERDICT: u16 = 2;
const NFTA_VERDICT_CODE: u16 = 1;

const NFTA_PAYLOAD_DREG: u16 = 1;
const NFTA_PAYLOAD_BASE: u16 = 2;
const NFTA_PAYLOAD_OFFSET: u16 = 3;
const NFTA_PAYLOAD_LEN: u16 = 4;
const NFTA_PAYLOAD_SREG: u16 = 5;

const NFTA_CMP_SREG: u16 = 1;
const NFTA_CMP_OP: u16 = 2;
const NFTA_CMP_DATA: u16 = 3;

const NFTA_BITWISE_SREG: u16 = 1;
const NFTA_BITWISE_DREG: u16 = 2;
const NFTA_BITWISE_LEN: u16 = 3;
const NFTA_BITWISE_MASK: u16 = 4;
const NFTA_BITWISE_XOR: u16 = 5;
const NFTA_BITWISE_OP: u16 = 6;
const NFT_BITWISE_BOOL: u32 = 0;

const NFTA_IMMEDIATE_DREG: u16 = 1;
const NFTA_IMMEDIATE_DATA: u16 = 2;

const NFTA_META_DREG: u16 = 1;
const NFTA_META_KEY: u16 = 2;
const NFTA_META_SREG: u16 = 3;

const NFTA_CT_DREG: u16 = 1;
const NFTA_CT_KEY: u16 = 2;
const NFTA_CT_DIRECTION: u16 = 3;
const NFTA_CT_SREG: u16 = 4;

const NFTA_NAT_TYPE: u16 = 1;
const NFTA_NAT_FAMILY: u16 = 2;
const NFTA_NAT_REG_ADDR_MIN: u16 = 3;
const NFTA_NAT_REG_ADDR_MAX: u16 = 4;
const NFTA_NAT_FLAGS: u16 = 7;

const NFTA_MASQ_FLAGS: u16 = 1;

const NFTA_RANGE_SREG: u16 = 1;
const NFTA_RANGE_OP: u16 = 2;
const NFTA_RANGE_FROM_DATA: u16 = 3;
const NFTA_RANGE_TO_DATA: u16 = 4;

const NFTA_LOOKUP_SET: u16 = 1;
const NFTA_LOOKUP_SREG: u16 = 2;
const NFTA_LOOKUP_FLAGS: u16 = 5;
const NFT_LOOKUP_F_INV: u32 = 1;

const NFTA_EXTHDR_DREG: u16 = 1;
const NFTA_EXTHDR_TYPE: u16 = 2;
const NFTA_EXTHDR_OFFSET: u16 = 3;
const NFTA_EXTHDR_LEN: u16 = 4;
const NFTA_EXTHDR_OP: u16 = 6;
const NFTA_EXTHDR_SREG: u16 = 7;
const NFT_EXTHDR_OP_TCPOPT: u32 = 1;

const NFTA_COUNTER_BYTES: u16 = 1;
const NFTA_COUNTER_PACKETS: u16 = 2;

const NFTA_RT_DREG: u16 = 1;
const NFTA_RT_KEY: u16 = 2;

const NFTA_BYTEORDER_SREG: u16 = 1;
const NFTA_BYTEORDER_DREG: u16 = 2;
const NFTA_BYTEORDER_OP: u16 = 3;
const NFTA_BYTEORDER_LEN: u16 = 4;
const NFTA_BYTEORDER_SIZE: u16 = 5;

const NF_NAT_RANGE_MAP_IPS: u32 = 1 << 0;
const NF_NAT_RANGE_NETMAP: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadBase {
    Link,
    Network,
    Transport,
}

impl PayloadBase {
    fn code(&self) -> u32 {
        match self {
            Self::Link => 0,
            Self::Network => 1,
            Self::Transport => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        [Self::Link, Self::Network, Self::Transport]
            .into_iter()
            .find(|b| b.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    fn code(&self) -> u32 {
        match self {
            Self::Eq => 0,
            Self::Neq => 1,
            Self::Lt => 2,
            Self::Lte => 3,
            Self::Gt => 4,
            Self::Gte => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        [Self::Eq, Self::Neq, Self::Lt, Self::Lte, Self::Gt, Self::Gte]
            .into_iter()
            .find(|op| op.code() == code)
    }
}

/// Operator of a range test. The kernel only implements these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeOp {
    Eq,
    Neq,
}

impl RangeOp {
    fn code(&self) -> u32 {
        match self {
            Self::Eq => 0,
            Self::Neq => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Eq),
            1 => Some(Self::Neq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaKey {
    Mark,
    Iifname,
    Oifname,
    L4proto,
}

impl MetaKey {
    fn code(&self) -> u32 {
        match self {
            Self::Mark => 3,
            Self::Iifname => 6,
            Self::Oifname => 7,
            Self::L4proto => 16,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        [Self::Mark, Self::Iifname, Self::Oifname, Self::L4proto]
            .into_iter()
            .find(|k| k.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtKey {
    Mark,
}

impl CtKey {
    fn code(&self) -> u32 {
        match self {
            Self::Mark => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        (code == 3).then_some(Self::Mark)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtKey {
    Tcpmss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    Snat,
    Dnat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    fn code(&self) -> u32 {
        match self {
            Self::Drop => 0,
            Self::Accept => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Drop),
            1 => Some(Self::Accept),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteorderOp {
    Ntoh,
    Hton,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImmediateData {
    Value(Vec<u8>),
    Verdict(Verdict),
}

/// One nf_tables virtual-machine instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "lowercase")]
pub enum Expr {
    Payload {
        dreg: u32,
        base: PayloadBase,
        offset: u32,
        len: u32,
    },
    Cmp {
        sreg: u32,
        op: CmpOp,
        data: Vec<u8>,
    },
    Bitwise {
        sreg: u32,
        dreg: u32,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Immediate {
        dreg: u32,
        data: ImmediateData,
    },
    Meta {
        key: MetaKey,
        dreg: u32,
    },
    MetaSet {
        key: MetaKey,
        sreg: u32,
    },
    Ct {
        key: CtKey,
        dreg: u32,
    },
    CtSet {
        key: CtKey,
        sreg: u32,
    },
    Nat {
        kind: NatKind,
        family: u32,
        reg_addr_min: u32,
        reg_addr_max: u32,
        /// Address registers hold a network to map onto, not a plain range
        prefix: bool,
    },
    Masq,
    /// Inclusive range test
    Range {
        sreg: u32,
        op: RangeOp,
        from: Vec<u8>,
        to: Vec<u8>,
    },
    Lookup {
        sreg: u32,
        set: String,
        invert: bool,
    },
    /// TCP option write
    Exthdr {
        sreg: u32,
        kind: u8,
        offset: u32,
        len: u32,
    },
    Counter {
        bytes: u64,
        packets: u64,
    },
    Rt {
        key: RtKey,
        dreg: u32,
    },
    Byteorder {
        sreg: u32,
        dreg: u32,
        op: ByteorderOp,
        len: u32,
        size: u32,
    },
    /// Read back from the kernel in a shape this crate does not model.
    /// `data` is the raw `NFTA_EXPR_DATA` payload.
    Opaque {
        name: String,
        data: Vec<u8>,
    },
}

impl Expr {
    pub fn verdict(verdict: Verdict) -> Self {
        Self::Immediate {
            dreg: NFT_REG_VERDICT,
            data: ImmediateData::Verdict(verdict),
        }
    }

    pub fn immediate(dreg: u32, value: Vec<u8>) -> Self {
        Self::Immediate {
            dreg,
            data: ImmediateData::Value(value),
        }
    }

    pub fn cmp(op: CmpOp, data: Vec<u8>) -> Self {
        Self::Cmp {
            sreg: NFT_REG_1,
            op,
            data,
        }
    }

    /// Kernel expression type name
    pub fn name(&self) -> &str {
        match self {
            Self::Payload { .. } => "payload",
            Self::Cmp { .. } => "cmp",
            Self::Bitwise { .. } => "bitwise",
            Self::Immediate { .. } => "immediate",
            Self::Meta { .. } | Self::MetaSet { .. } => "meta",
            Self::Ct { .. } | Self::CtSet { .. } => "ct",
            Self::Nat { .. } => "nat",
            Self::Masq => "masq",
            Self::Range { .. } => "range",
            Self::Lookup { .. } => "lookup",
            Self::Exthdr { .. } => "exthdr",
            Self::Counter { .. } => "counter",
            Self::Rt { .. } => "rt",
            Self::Byteorder { .. } => "byteorder",
            Self::Opaque { name, .. } => name.as_str(),
        }
    }

    /// Encode as an `NFTA_LIST_ELEM` attribute, the form stored in a rule's expression list.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        append_expr(&mut buf, self.name(), |data| self.marshal_data(data));
        buf
    }

    fn marshal_data(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Payload {
                dreg,
                base,
                offset,
                len,
            } => {
                push_attr_u32(buf, NFTA_PAYLOAD_DREG, *dreg);
                push_attr_u32(buf, NFTA_PAYLOAD_BASE, base.code());
                push_attr_u32(buf, NFTA_PAYLOAD_OFFSET, *offset);
                push_attr_u32(buf, NFTA_PAYLOAD_LEN, *len);
            }
            Self::Cmp { sreg, op, data } => {
                push_attr_u32(buf, NFTA_CMP_SREG, *sreg);
                push_attr_u32(buf, NFTA_CMP_OP, op.code());
                push_data_value(buf, NFTA_CMP_DATA, data);
            }
            Self::Bitwise {
                sreg,
                dreg,
                len,
                mask,
                xor,
            } => {
                push_attr_u32(buf, NFTA_BITWISE_SREG, *sreg);
                push_attr_u32(buf, NFTA_BITWISE_DREG, *dreg);
                push_attr_u32(buf, NFTA_BITWISE_LEN, *len);
                push_data_value(buf, NFTA_BITWISE_MASK, mask);
                push_data_value(buf, NFTA_BITWISE_XOR, xor);
            }
            Self::Immediate { dreg, data } => {
                push_attr_u32(buf, NFTA_IMMEDIATE_DREG, *dreg);
                match data {
                    ImmediateData::Value(value) => push_data_value(buf, NFTA_IMMEDIATE_DATA, value),
                    ImmediateData::Verdict(verdict) => {
                        push_attr_nested(buf, NFTA_IMMEDIATE_DATA, |imm| {
                            push_attr_nested(imm, NFTA_DATA_VERDICT, |v| {
                                push_attr_u32(v, NFTA_VERDICT_CODE, verdict.code());
                            });
                        });
                    }
                }
            }
            Self::Meta { key, dreg } => {
                push_attr_u32(buf, NFTA_META_DREG, *dreg);
                push_attr_u32(buf, NFTA_META_KEY, key.code());
            }
            Self::MetaSet { key, sreg } => {
                push_attr_u32(buf, NFTA_META_KEY, key.code());
                push_attr_u32(buf, NFTA_META_SREG, *sreg);
            }
            Self::Ct { key, dreg } => {
                push_attr_u32(buf, NFTA_CT_DREG, *dreg);
                push_attr_u32(buf, NFTA_CT_KEY, key.code());
            }
            Self::CtSet { key, sreg } => {
                push_attr_u32(buf, NFTA_CT_KEY, key.code());
                push_attr_u32(buf, NFTA_CT_SREG, *sreg);
            }
            Self::Nat {
                kind,
                family,
                reg_addr_min,
                reg_addr_max,
                prefix,
            } => {
                let kind = match kind {
                    NatKind::Snat => 0,
                    NatKind::Dnat => 1,
                };
                let mut flags = NF_NAT_RANGE_MAP_IPS;
                if *prefix {
                    flags |= NF_NAT_RANGE_NETMAP;
                }
                push_attr_u32(buf, NFTA_NAT_TYPE, kind);
                push_attr_u32(buf, NFTA_NAT_FAMILY, *family);
                push_attr_u32(buf, NFTA_NAT_REG_ADDR_MIN, *reg_addr_min);
                push_attr_u32(buf, NFTA_NAT_REG_ADDR_MAX, *reg_addr_max);
                push_attr_u32(buf, NFTA_NAT_FLAGS, flags);
            }
            Self::Masq => push_attr_u32(buf, NFTA_MASQ_FLAGS, 0),
            Self::Range { sreg, op, from, to } => {
                push_attr_u32(buf, NFTA_RANGE_SREG, *sreg);
                push_attr_u32(buf, NFTA_RANGE_OP, op.code());
                push_data_value(buf, NFTA_RANGE_FROM_DATA, from);
                push_data_value(buf, NFTA_RANGE_TO_DATA, to);
            }
            Self::Lookup { sreg, set, invert } => {
                push_attr_str(buf, NFTA_LOOKUP_SET, set);
                push_attr_u32(buf, NFTA_LOOKUP_SREG, *sreg);
                if *invert {
                    push_attr_u32(buf, NFTA_LOOKUP_FLAGS, NFT_LOOKUP_F_INV);
                }
            }
            Self::Exthdr {
                sreg,
                kind,
                offset,
                len,
            } => {
                push_attr_u8(buf, NFTA_EXTHDR_TYPE, *kind);
                push_attr_u32(buf, NFTA_EXTHDR_OFFSET, *offset);
                push_attr_u32(buf, NFTA_EXTHDR_LEN, *len);
                push_attr_u32(buf, NFTA_EXTHDR_OP, NFT_EXTHDR_OP_TCPOPT);
                push_attr_u32(buf, NFTA_EXTHDR_SREG, *sreg);
            }
            Self::Counter { bytes, packets } => {
                push_attr_u64(buf, NFTA_COUNTER_BYTES, *bytes);
                push_attr_u64(buf, NFTA_COUNTER_PACKETS, *packets);
            }
            Self::Rt { key, dreg } => {
                let key = match key {
                    RtKey::Tcpmss => 4,
                };
                push_attr_u32(buf, NFTA_RT_DREG, *dreg);
                push_attr_u32(buf, NFTA_RT_KEY, key);
            }
            Self::Byteorder {
                sreg,
                dreg,
                op,
                len,
                size,
            } => {
                let op = match op {
                    ByteorderOp::Ntoh => 0,
                    ByteorderOp::Hton => 1,
                };
                push_attr_u32(buf, NFTA_BYTEORDER_SREG, *sreg);
                push_attr_u32(buf, NFTA_BYTEORDER_DREG, *dreg);
                push_attr_u32(buf, NFTA_BYTEORDER_OP, op);
                push_attr_u32(buf, NFTA_BYTEORDER_LEN, *len);
                push_attr_u32(buf, NFTA_BYTEORDER_SIZE, *size);
            }
            Self::Opaque { data, .. } => buf.extend_from_slice(data),
        }
    }

    /// Decode the payload of an `NFTA_RULE_EXPRESSIONS` attribute.
    pub fn decode_list(list: &[u8]) -> Result<Vec<Self>, DecodeError> {
        Attrs::parse(list)?
            .iter()
            .filter(|(attr_type, _)| *attr_type == NFTA_LIST_ELEM)
            .map(|(_, elem)| Self::decode(elem))
            .collect()
    }

    /// Decode one `NFTA_LIST_ELEM` payload. Shapes outside this model,
    /// including unknown keys and extra semantic attributes, become [`Expr::Opaque`].
    pub fn decode(elem: &[u8]) -> Result<Self, DecodeError> {
        let attrs = Attrs::parse(elem)?;
        let name = attrs.string(NFTA_EXPR_NAME, "expression name")?;
        let raw = attrs.get(NFTA_EXPR_DATA).unwrap_or_default();
        let data = Attrs::parse(raw)?;

        let decoded = Self::decode_data(&name, &data).ok().flatten();
        Ok(decoded.unwrap_or_else(|| Self::Opaque {
            name,
            data: raw.to_vec(),
        }))
    }

    fn decode_data(name: &str, data: &Attrs<'_>) -> Result<Option<Self>, DecodeError> {
        let expr = match name {
            "payload" => {
                if data.has(NFTA_PAYLOAD_SREG) {
                    return Ok(None);
                }
                let Some(base) = PayloadBase::from_code(data.u32(NFTA_PAYLOAD_BASE, "payload base")?)
                else {
                    return Ok(None);
                };
                Self::Payload {
                    dreg: data.u32(NFTA_PAYLOAD_DREG, "payload dreg")?,
                    base,
                    offset: data.u32(NFTA_PAYLOAD_OFFSET, "payload offset")?,
                    len: data.u32(NFTA_PAYLOAD_LEN, "payload len")?,
                }
            }
            "cmp" => {
                let Some(op) = CmpOp::from_code(data.u32(NFTA_CMP_OP, "cmp op")?) else {
                    return Ok(None);
                };
                Self::Cmp {
                    sreg: data.u32(NFTA_CMP_SREG, "cmp sreg")?,
                    op,
                    data: data_value(data, NFTA_CMP_DATA, "cmp data")?,
                }
            }
            "bitwise" => {
                if data.opt_u32(NFTA_BITWISE_OP, "bitwise op")?.unwrap_or(NFT_BITWISE_BOOL)
                    != NFT_BITWISE_BOOL
                {
                    return Ok(None);
                }
                Self::Bitwise {
                    sreg: data.u32(NFTA_BITWISE_SREG, "bitwise sreg")?,
                    dreg: data.u32(NFTA_BITWISE_DREG, "bitwise dreg")?,
                    len: data.u32(NFTA_BITWISE_LEN, "bitwise len")?,
                    mask: data_value(data, NFTA_BITWISE_MASK, "bitwise mask")?,
                    xor: data_value(data, NFTA_BITWISE_XOR, "bitwise xor")?,
                }
            }
            "immediate" => {
                let dreg = data.u32(NFTA_IMMEDIATE_DREG, "immediate dreg")?;
                let value = data.nested(NFTA_IMMEDIATE_DATA, "immediate data")?;
                if let Some(bytes) = value.get(NFTA_DATA_VALUE) {
                    Self::immediate(dreg, bytes.to_vec())
                } else {
                    let verdict = value.nested(NFTA_DATA_VERDICT, "verdict")?;
                    let Some(code) = Verdict::from_code(verdict.u32(NFTA_VERDICT_CODE, "verdict code")?)
                    else {
                        return Ok(None);
                    };
                    Self::Immediate {
                        dreg,
                        data: ImmediateData::Verdict(code),
                    }
                }
            }
            "meta" => {
                let Some(key) = MetaKey::from_code(data.u32(NFTA_META_KEY, "meta key")?) else {
                    return Ok(None);
                };
                match data.opt_u32(NFTA_META_SREG, "meta sreg")? {
                    Some(sreg) => Self::MetaSet { key, sreg },
                    None => Self::Meta {
                        key,
                        dreg: data.u32(NFTA_META_DREG, "meta dreg")?,
                    },
                }
            }
            "ct" => {
                if data.has(NFTA_CT_DIRECTION) {
                    return Ok(None);
                }
                let Some(key) = CtKey::from_code(data.u32(NFTA_CT_KEY, "ct key")?) else {
                    return Ok(None);
                };
                match data.opt_u32(NFTA_CT_SREG, "ct sreg")? {
                    Some(sreg) => Self::CtSet { key, sreg },
                    None => Self::Ct {
                        key,
                        dreg: data.u32(NFTA_CT_DREG, "ct dreg")?,
                    },
                }
            }
            "nat" => {
                let kind = match data.u32(NFTA_NAT_TYPE, "nat type")? {
                    0 => NatKind::Snat,
                    1 => NatKind::Dnat,
                    _ => return Ok(None),
                };
                let flags = data.opt_u32(NFTA_NAT_FLAGS, "nat flags")?.unwrap_or(0);
                if flags & !(NF_NAT_RANGE_MAP_IPS | NF_NAT_RANGE_NETMAP) != 0 {
                    return Ok(None);
                }
                Self::Nat {
                    kind,
                    family: data.u32(NFTA_NAT_FAMILY, "nat family")?,
                    reg_addr_min: data.u32(NFTA_NAT_REG_ADDR_MIN, "nat addr min")?,
                    reg_addr_max: data.u32(NFTA_NAT_REG_ADDR_MAX, "nat addr max")?,
                    prefix: flags & NF_NAT_RANGE_NETMAP != 0,
                }
            }
            "masq" => {
                if data.opt_u32(NFTA_MASQ_FLAGS, "masq flags")?.unwrap_or(0) != 0 {
                    return Ok(None);
                }
                Self::Masq
            }
            "range" => {
                let Some(op) = RangeOp::from_code(data.u32(NFTA_RANGE_OP, "range op")?) else {
                    return Ok(None);
                };
                Self::Range {
                    sreg: data.u32(NFTA_RANGE_SREG, "range sreg")?,
                    op,
                    from: data_value(data, NFTA_RANGE_FROM_DATA, "range from")?,
                    to: data_value(data, NFTA_RANGE_TO_DATA, "range to")?,
                }
            }
            "lookup" => {
                let flags = data.opt_u32(NFTA_LOOKUP_FLAGS, "lookup flags")?.unwrap_or(0);
                if flags & !NFT_LOOKUP_F_INV != 0 {
                    return Ok(None);
                }
                Self::Lookup {
                    sreg: data.u32(NFTA_LOOKUP_SREG, "lookup sreg")?,
                    set: data.string(NFTA_LOOKUP_SET, "lookup set")?,
                    invert: flags & NFT_LOOKUP_F_INV != 0,
                }
            }
            "exthdr" => {
                if data.has(NFTA_EXTHDR_DREG)
                    || data.u32(NFTA_EXTHDR_OP, "exthdr op")? != NFT_EXTHDR_OP_TCPOPT
                {
                    return Ok(None);
                }
                Self::Exthdr {
                    sreg: data.u32(NFTA_EXTHDR_SREG, "exthdr sreg")?,
                    kind: data.u8(NFTA_EXTHDR_TYPE, "exthdr type")?,
                    offset: data.u32(NFTA_EXTHDR_OFFSET, "exthdr offset")?,
                    len: data.u32(NFTA_EXTHDR_LEN, "exthdr len")?,
                }
            }
            "counter" => Self::Counter {
                bytes: data.u64(NFTA_COUNTER_BYTES, "counter bytes")?,
                packets: data.u64(NFTA_COUNTER_PACKETS, "counter packets")?,
            },
            "rt" => {
                if data.u32(NFTA_RT_KEY, "rt key")? != 4 {
                    return Ok(None);
                }
                Self::Rt {
                    key: RtKey::Tcpmss,
                    dreg: data.u32(NFTA_RT_DREG, "rt dreg")?,
                }
            }
            "byteorder" => {
                let op = match data.u32(NFTA_BYTEORDER_OP, "byteorder op")? {
                    0 => ByteorderOp::Ntoh,
                    1 => ByteorderOp::Hton,
                    _ => return Ok(None),
                };
                Self::Byteorder {
                    sreg: data.u32(NFTA_BYTEORDER_SREG, "byteorder sreg")?,
                    dreg: data.u32(NFTA_BYTEORDER_DREG, "byteorder dreg")?,
                    op,
                    len: data.u32(NFTA_BYTEORDER_LEN, "byteorder len")?,
                    size: data.u32(NFTA_BYTEORDER_SIZE, "byteorder size")?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(expr))
    }
}

fn data_value(attrs: &Attrs<'_>, attr_type: u16, what: &'static str) -> Result<Vec<u8>, DecodeError> {
    Ok(attrs
        .nested(attr_type, what)?
        .bytes(NFTA_DATA_VALUE, what)?
        .to_vec())
}

fn push_data_value(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    push_attr_nested(buf, attr_type, |nested| {
        push_attr_bytes(nested, NFTA_DATA_VALUE, data);
    });
}
