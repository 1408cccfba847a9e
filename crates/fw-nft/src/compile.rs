// Match/action compiler: declared rules to ordered nf_tables instructions
use fw_core::{
    DevPosition, Family, FilterAction, FilterRule, IFNAMSIZ, IpPosition, IpValue, Match, MatchKind,
    MatchOp, NatRule, NatType, PortPosition, PortValue, RuleRef, ValueError, check_ifname,
    parse_mark,
};
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

use crate::expr::{
    CmpOp, CtKey, Expr, MetaKey, NFPROTO_IPV4, NFPROTO_IPV6, NFT_REG_1, NFT_REG_2, NatKind,
    PayloadBase, RangeOp, TCPOPT_MAXSEG, Verdict,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    InvalidValue(#[from] ValueError),

    #[error("unsupported {kind} value '{value}'")]
    UnsupportedValue { kind: &'static str, value: String },

    #[error("{0} requires a 'to' target")]
    MissingNatTarget(NatType),

    #[error("masquerade does not take a 'to' target")]
    UnexpectedNatTarget,

    #[error("address {addr} does not belong to a {family} table")]
    FamilyMismatch { family: Family, addr: String },

    #[error("match must set exactly one of ip, port, dev, proto")]
    AmbiguousMatch,

    #[error("invalid value for action {action}: {reason}")]
    InvalidActionValue { action: FilterAction, reason: String },

    #[error("{0} are not implemented")]
    Unimplemented(&'static str),

    #[error("rule name is {len} bytes, longer than the {max} a rule comment holds")]
    NameTooLong { len: usize, max: usize },
}

/// Table context a rule compiles against; the family fixes header offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileContext {
    pub family: Family,
}

impl CompileContext {
    pub fn new(family: Family) -> Self {
        Self { family }
    }
}

/// Compile one rule: every match in declaration order, then the action.
pub fn compile_rule(rule: RuleRef<'_>, ctx: &CompileContext) -> Result<Vec<Expr>, CompileError> {
    match rule {
        RuleRef::Filter(rule) => {
            let mut exprs = compile_matches(&rule.matches, ctx)?;
            exprs.extend(compile_filter_action(rule)?);
            Ok(exprs)
        }
        RuleRef::Nat(rule) => {
            let mut exprs = compile_matches(&rule.matches, ctx)?;
            exprs.extend(compile_nat_action(rule, ctx)?);
            Ok(exprs)
        }
        RuleRef::Route(_) => Err(CompileError::Unimplemented("route rules")),
    }
}

pub fn compile_matches(matches: &[Match], ctx: &CompileContext) -> Result<Vec<Expr>, CompileError> {
    let mut exprs = Vec::new();
    for m in matches {
        exprs.extend(compile_match(m, ctx)?);
    }
    Ok(exprs)
}

pub fn compile_match(m: &Match, ctx: &CompileContext) -> Result<Vec<Expr>, CompileError> {
    if m.populated() != 1 {
        return Err(CompileError::AmbiguousMatch);
    }

    match m.kind() {
        Some(MatchKind::Ip(ip)) => compile_ip(m.op, &ip.value, ip.position, ctx),
        Some(MatchKind::Port(port)) => compile_port(m.op, &port.value, port.position),
        Some(MatchKind::Dev(dev)) => compile_dev(m.op, &dev.value, dev.position),
        Some(MatchKind::Proto(proto)) => Ok(vec![
            Expr::Meta {
                key: MetaKey::L4proto,
                dreg: NFT_REG_1,
            },
            Expr::cmp(cmp_op(m.op), vec![proto.value.number()]),
        ]),
        None => Err(CompileError::AmbiguousMatch),
    }
}

fn cmp_op(op: MatchOp) -> CmpOp {
    match op {
        MatchOp::Eq => CmpOp::Eq,
        MatchOp::Neq => CmpOp::Neq,
    }
}

fn range_op(op: MatchOp) -> RangeOp {
    match op {
        MatchOp::Eq => RangeOp::Eq,
        MatchOp::Neq => RangeOp::Neq,
    }
}

fn compile_ip(
    op: MatchOp,
    value: &str,
    position: IpPosition,
    ctx: &CompileContext,
) -> Result<Vec<Expr>, CompileError> {
    let parsed: IpValue = value.parse()?;

    match parsed {
        IpValue::Void => Err(CompileError::UnsupportedValue {
            kind: "ip",
            value: value.to_string(),
        }),
        IpValue::Addr(addr) => Ok(vec![
            address_load(ctx.family, &addr, position)?,
            Expr::cmp(cmp_op(op), addr_bytes(&addr)),
        ]),
        IpValue::Subnet(net) => {
            let network = net.network();
            let mask = addr_bytes(&net.netmask());
            let len = mask.len() as u32;
            Ok(vec![
                address_load(ctx.family, &network, position)?,
                Expr::Bitwise {
                    sreg: NFT_REG_1,
                    dreg: NFT_REG_1,
                    len,
                    mask,
                    xor: vec![0; len as usize],
                },
                Expr::cmp(cmp_op(op), addr_bytes(&network)),
            ])
        }
        IpValue::Range(start, end) => Ok(vec![
            address_load(ctx.family, &start, position)?,
            Expr::Range {
                sreg: NFT_REG_1,
                op: range_op(op),
                from: addr_bytes(&start),
                to: addr_bytes(&end),
            },
        ]),
        IpValue::SetRef(set) => {
            // Sets only hold IPv4 addresses
            if ctx.family == Family::Ipv6 {
                return Err(CompileError::FamilyMismatch {
                    family: ctx.family,
                    addr: format!("@{}", set),
                });
            }
            let key = IpAddr::from([0, 0, 0, 0]);
            Ok(vec![
                address_load(ctx.family, &key, position)?,
                Expr::Lookup {
                    sreg: NFT_REG_1,
                    set,
                    invert: op == MatchOp::Neq,
                },
            ])
        }
    }
}

/// Payload load of a source or destination address, offset by family.
fn address_load(family: Family, addr: &IpAddr, position: IpPosition) -> Result<Expr, CompileError> {
    if !family.carries(addr) {
        return Err(CompileError::FamilyMismatch {
            family,
            addr: addr.to_string(),
        });
    }

    let (base, offset) = match (family, addr) {
        (Family::Arp, _) => match position {
            IpPosition::Src => (PayloadBase::Network, 14),
            IpPosition::Dst => (PayloadBase::Network, 24),
        },
        (_, IpAddr::V4(_)) => match position {
            IpPosition::Src => (PayloadBase::Network, 12),
            IpPosition::Dst => (PayloadBase::Network, 16),
        },
        (_, IpAddr::V6(_)) => match position {
            IpPosition::Src => (PayloadBase::Network, 8),
            IpPosition::Dst => (PayloadBase::Network, 24),
        },
    };

    Ok(Expr::Payload {
        dreg: NFT_REG_1,
        base,
        offset,
        len: addr_bytes(addr).len() as u32,
    })
}

fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn compile_port(op: MatchOp, value: &str, position: PortPosition) -> Result<Vec<Expr>, CompileError> {
    let offset = match position {
        PortPosition::Src => 0,
        PortPosition::Dst => 2,
    };
    let load = Expr::Payload {
        dreg: NFT_REG_1,
        base: PayloadBase::Transport,
        offset,
        len: 2,
    };

    match value.parse::<PortValue>()? {
        PortValue::Single(port) => Ok(vec![load, Expr::cmp(cmp_op(op), port.to_be_bytes().to_vec())]),
        // Inclusive bounds; the declared op does not apply to ranges
        PortValue::Range(start, end) => Ok(vec![
            load,
            Expr::cmp(CmpOp::Gte, start.to_be_bytes().to_vec()),
            Expr::cmp(CmpOp::Lte, end.to_be_bytes().to_vec()),
        ]),
    }
}

fn compile_dev(op: MatchOp, value: &str, position: DevPosition) -> Result<Vec<Expr>, CompileError> {
    check_ifname(value)?;

    let key = match position {
        DevPosition::In => MetaKey::Iifname,
        DevPosition::Out => MetaKey::Oifname,
    };
    let mut name = value.as_bytes().to_vec();
    name.resize(IFNAMSIZ, 0);

    Ok(vec![
        Expr::Meta {
            key,
            dreg: NFT_REG_1,
        },
        Expr::cmp(cmp_op(op), name),
    ])
}

pub fn compile_filter_action(rule: &FilterRule) -> Result<Vec<Expr>, CompileError> {
    let value = rule.value.as_deref();

    match rule.action {
        FilterAction::CtMark => {
            let mark = parse_mark(value.unwrap_or_default()).map_err(|reason| {
                CompileError::InvalidActionValue {
                    action: rule.action,
                    reason,
                }
            })?;
            Ok(vec![
                Expr::immediate(NFT_REG_1, mark.to_ne_bytes().to_vec()),
                Expr::CtSet {
                    key: CtKey::Mark,
                    sreg: NFT_REG_1,
                },
            ])
        }
        FilterAction::SetMetaMarkFromCtMark => Ok(vec![
            Expr::Ct {
                key: CtKey::Mark,
                dreg: NFT_REG_1,
            },
            Expr::MetaSet {
                key: MetaKey::Mark,
                sreg: NFT_REG_1,
            },
        ]),
        FilterAction::Accept => Ok(vec![Expr::verdict(Verdict::Accept)]),
        FilterAction::Drop => Ok(vec![Expr::verdict(Verdict::Drop)]),
        FilterAction::TcpMssClamp => {
            let mss: u16 = value
                .unwrap_or_default()
                .trim()
                .parse()
                .map_err(|_| CompileError::InvalidActionValue {
                    action: rule.action,
                    reason: format!("'{}' is not a 16-bit MSS", value.unwrap_or_default()),
                })?;
            Ok(vec![
                Expr::immediate(NFT_REG_1, mss.to_be_bytes().to_vec()),
                Expr::Exthdr {
                    sreg: NFT_REG_1,
                    kind: TCPOPT_MAXSEG,
                    offset: 2,
                    len: 2,
                },
            ])
        }
    }
}

pub fn compile_nat_action(rule: &NatRule, ctx: &CompileContext) -> Result<Vec<Expr>, CompileError> {
    let kind = match rule.nat_type {
        NatType::Dnat => NatKind::Dnat,
        NatType::Snat => NatKind::Snat,
        NatType::Masquerade => {
            return match rule.to.as_deref().map(str::trim) {
                None | Some("") => Ok(vec![Expr::Masq]),
                Some(_) => Err(CompileError::UnexpectedNatTarget),
            };
        }
    };

    let to = match rule.to.as_deref().map(str::trim) {
        None | Some("") => return Err(CompileError::MissingNatTarget(rule.nat_type)),
        Some(to) => to,
    };

    let (min, max, prefix) = match to.parse::<IpValue>()? {
        IpValue::Addr(addr) => (addr, None, false),
        IpValue::Subnet(net) => {
            let (first, last) = usable_range(&net);
            (first, Some(last), true)
        }
        IpValue::Range(start, end) => (start, Some(end), false),
        other => {
            return Err(CompileError::UnsupportedValue {
                kind: other.kind(),
                value: to.to_string(),
            });
        }
    };

    let family = nat_family(ctx.family, &min)?;
    let mut exprs = vec![Expr::immediate(NFT_REG_1, addr_bytes(&min))];
    let reg_addr_max = match max {
        Some(max) => {
            exprs.push(Expr::immediate(NFT_REG_2, addr_bytes(&max)));
            NFT_REG_2
        }
        None => NFT_REG_1,
    };
    exprs.push(Expr::Nat {
        kind,
        family,
        reg_addr_min: NFT_REG_1,
        reg_addr_max,
        prefix,
    });

    Ok(exprs)
}

fn nat_family(family: Family, addr: &IpAddr) -> Result<u32, CompileError> {
    if !family.carries(addr) {
        return Err(CompileError::FamilyMismatch {
            family,
            addr: addr.to_string(),
        });
    }
    match addr {
        IpAddr::V4(_) => Ok(NFPROTO_IPV4),
        IpAddr::V6(_) => Ok(NFPROTO_IPV6),
    }
}

/// First and last host addresses of a subnet. Point-to-point and host
/// prefixes have no network/broadcast to skip and use the full span.
pub fn usable_range(net: &IpNet) -> (IpAddr, IpAddr) {
    match net {
        IpNet::V4(v4) => {
            let network = u32::from(v4.network());
            let broadcast = u32::from(v4.broadcast());
            if v4.prefix_len() >= 31 {
                (IpAddr::from(network.to_be_bytes()), IpAddr::from(broadcast.to_be_bytes()))
            } else {
                (
                    IpAddr::from((network + 1).to_be_bytes()),
                    IpAddr::from((broadcast - 1).to_be_bytes()),
                )
            }
        }
        IpNet::V6(v6) => {
            // IPv6 has no broadcast address; only the subnet-router anycast is skipped
            let network = u128::from(v6.network());
            let last = u128::from(v6.broadcast());
            if v6.prefix_len() >= 127 {
                (IpAddr::from(network.to_be_bytes()), IpAddr::from(last.to_be_bytes()))
            } else {
                (IpAddr::from((network + 1).to_be_bytes()), IpAddr::from(last.to_be_bytes()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fw_core::{L4Proto, TargetRef};

    fn ctx() -> CompileContext {
        CompileContext::new(Family::Inet)
    }

    fn nat(nat_type: NatType, to: Option<&str>) -> NatRule {
        NatRule {
            name: Some("n".into()),
            matches: vec![],
            nat_type,
            to: to.map(str::to_string),
            target_ref: None::<TargetRef>,
        }
    }

    fn filter(action: FilterAction, value: Option<&str>, matches: Vec<Match>) -> FilterRule {
        FilterRule {
            name: Some("f".into()),
            matches,
            action,
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn single_ip_loads_and_compares() {
        let m = Match::ip(MatchOp::Eq, "192.168.1.5", IpPosition::Src);
        let exprs = compile_match(&m, &ctx()).unwrap();
        assert_eq!(
            exprs,
            vec![
                Expr::Payload {
                    dreg: NFT_REG_1,
                    base: PayloadBase::Network,
                    offset: 12,
                    len: 4
                },
                Expr::cmp(CmpOp::Eq, vec![192, 168, 1, 5]),
            ]
        );
    }

    #[test]
    fn subnet_masks_before_compare() {
        let m = Match::ip(MatchOp::Neq, "10.1.2.3/16", IpPosition::Dst);
        let exprs = compile_match(&m, &ctx()).unwrap();
        assert_eq!(exprs.len(), 3);
        assert!(matches!(exprs[0], Expr::Payload { offset: 16, .. }));
        assert!(matches!(&exprs[1], Expr::Bitwise { mask, .. } if mask == &vec![255, 255, 0, 0]));
        assert_eq!(exprs[2], Expr::cmp(CmpOp::Neq, vec![10, 1, 0, 0]));
    }

    #[test]
    fn ip_range_and_set_reference() {
        let range = Match::ip(MatchOp::Neq, "10.0.0.1-10.0.0.9", IpPosition::Src);
        let exprs = compile_match(&range, &ctx()).unwrap();
        assert!(matches!(&exprs[1], Expr::Range { op: RangeOp::Neq, from, to, .. }
            if from == &vec![10, 0, 0, 1] && to == &vec![10, 0, 0, 9]));

        let set = Match::ip(MatchOp::Neq, "@blocked", IpPosition::Src);
        let exprs = compile_match(&set, &ctx()).unwrap();
        assert_eq!(
            exprs[1],
            Expr::Lookup {
                sreg: NFT_REG_1,
                set: "blocked".into(),
                invert: true
            }
        );
    }

    #[test]
    fn offsets_follow_family() {
        let v6 = Match::ip(MatchOp::Eq, "fd00::1", IpPosition::Dst);
        let exprs = compile_match(&v6, &ctx()).unwrap();
        assert!(matches!(exprs[0], Expr::Payload { offset: 24, len: 16, .. }));

        let arp = Match::ip(MatchOp::Eq, "10.0.0.1", IpPosition::Src);
        let exprs = compile_match(&arp, &CompileContext::new(Family::Arp)).unwrap();
        assert!(matches!(exprs[0], Expr::Payload { offset: 14, len: 4, .. }));

        let err = compile_match(&v6, &CompileContext::new(Family::Ipv4)).unwrap_err();
        assert!(matches!(err, CompileError::FamilyMismatch { .. }));
    }

    #[test]
    fn void_ip_is_rejected() {
        let m = Match::ip(MatchOp::Eq, "", IpPosition::Src);
        assert!(matches!(
            compile_match(&m, &ctx()),
            Err(CompileError::UnsupportedValue { .. })
        ));
    }

    #[test]
    fn port_range_ignores_operator() {
        let m = Match::port(MatchOp::Neq, "3000-4000", PortPosition::Dst);
        let exprs = compile_match(&m, &ctx()).unwrap();
        let cmps: Vec<&Expr> = exprs
            .iter()
            .filter(|e| matches!(e, Expr::Cmp { .. }))
            .collect();
        assert_eq!(cmps.len(), 2);
        assert_eq!(*cmps[0], Expr::cmp(CmpOp::Gte, 3000u16.to_be_bytes().to_vec()));
        assert_eq!(*cmps[1], Expr::cmp(CmpOp::Lte, 4000u16.to_be_bytes().to_vec()));
    }

    #[test]
    fn dev_name_is_nul_padded() {
        let m = Match::dev(MatchOp::Eq, "eth0", DevPosition::Out);
        let exprs = compile_match(&m, &ctx()).unwrap();
        assert_eq!(
            exprs[0],
            Expr::Meta {
                key: MetaKey::Oifname,
                dreg: NFT_REG_1
            }
        );
        let Expr::Cmp { data, .. } = &exprs[1] else {
            panic!("expected cmp");
        };
        assert_eq!(data.len(), IFNAMSIZ);
        assert_eq!(&data[..4], b"eth0");
        assert!(data[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn matches_precede_action_in_declaration_order() {
        let rule = filter(
            FilterAction::Accept,
            None,
            vec![
                Match::proto(MatchOp::Eq, L4Proto::Udp),
                Match::port(MatchOp::Eq, "53", PortPosition::Dst),
            ],
        );
        let exprs = compile_rule(RuleRef::Filter(&rule), &ctx()).unwrap();
        let names: Vec<&str> = exprs.iter().map(Expr::name).collect();
        assert_eq!(names, vec!["meta", "cmp", "payload", "cmp", "immediate"]);
        assert_eq!(exprs[4], Expr::verdict(Verdict::Accept));
    }

    #[test]
    fn mark_actions() {
        let ctmark = filter(FilterAction::CtMark, Some("0x10"), vec![]);
        let exprs = compile_filter_action(&ctmark).unwrap();
        assert_eq!(exprs[0], Expr::immediate(NFT_REG_1, 16u32.to_ne_bytes().to_vec()));
        assert!(matches!(exprs[1], Expr::CtSet { key: CtKey::Mark, .. }));

        let copy = filter(FilterAction::SetMetaMarkFromCtMark, None, vec![]);
        let exprs = compile_filter_action(&copy).unwrap();
        assert!(matches!(exprs[0], Expr::Ct { key: CtKey::Mark, .. }));
        assert!(matches!(exprs[1], Expr::MetaSet { key: MetaKey::Mark, .. }));

        let bad = filter(FilterAction::CtMark, Some("mark"), vec![]);
        assert!(matches!(
            compile_filter_action(&bad),
            Err(CompileError::InvalidActionValue { .. })
        ));
    }

    #[test]
    fn mss_clamp_writes_tcp_option() {
        let rule = filter(FilterAction::TcpMssClamp, Some("1360"), vec![]);
        let exprs = compile_filter_action(&rule).unwrap();
        assert_eq!(exprs[0], Expr::immediate(NFT_REG_1, 1360u16.to_be_bytes().to_vec()));
        assert!(matches!(exprs[1], Expr::Exthdr { kind: TCPOPT_MAXSEG, .. }));
    }

    #[test]
    fn nat_single_address_uses_one_register() {
        let exprs = compile_nat_action(&nat(NatType::Dnat, Some("10.0.0.5")), &ctx()).unwrap();
        assert_eq!(exprs[0], Expr::immediate(NFT_REG_1, vec![10, 0, 0, 5]));
        assert_eq!(
            exprs[1],
            Expr::Nat {
                kind: NatKind::Dnat,
                family: NFPROTO_IPV4,
                reg_addr_min: NFT_REG_1,
                reg_addr_max: NFT_REG_1,
                prefix: false,
            }
        );
    }

    #[test]
    fn nat_subnet_spans_usable_hosts() {
        let exprs = compile_nat_action(&nat(NatType::Snat, Some("10.0.0.0/24")), &ctx()).unwrap();
        assert_eq!(exprs[0], Expr::immediate(NFT_REG_1, vec![10, 0, 0, 1]));
        assert_eq!(exprs[1], Expr::immediate(NFT_REG_2, vec![10, 0, 0, 254]));
        assert!(matches!(exprs[2], Expr::Nat { prefix: true, reg_addr_max: NFT_REG_2, .. }));

        let exprs =
            compile_nat_action(&nat(NatType::Snat, Some("10.0.0.1-10.0.0.3")), &ctx()).unwrap();
        assert!(matches!(exprs[2], Expr::Nat { prefix: false, reg_addr_max: NFT_REG_2, .. }));
    }

    #[test]
    fn nat_target_presence() {
        assert_eq!(
            compile_nat_action(&nat(NatType::Masquerade, None), &ctx()).unwrap(),
            vec![Expr::Masq]
        );
        assert_eq!(
            compile_nat_action(&nat(NatType::Snat, None), &ctx()),
            Err(CompileError::MissingNatTarget(NatType::Snat))
        );
        assert_eq!(
            compile_nat_action(&nat(NatType::Masquerade, Some("10.0.0.1")), &ctx()),
            Err(CompileError::UnexpectedNatTarget)
        );
    }

    #[test]
    fn usable_range_edges() {
        let (first, last) = usable_range(&"192.168.0.0/31".parse().unwrap());
        assert_eq!(first.to_string(), "192.168.0.0");
        assert_eq!(last.to_string(), "192.168.0.1");

        let (first, last) = usable_range(&"fd00::/64".parse().unwrap());
        assert_eq!(first.to_string(), "fd00::1");
        assert_eq!(last.to_string(), "fd00::ffff:ffff:ffff:ffff");
    }
}
