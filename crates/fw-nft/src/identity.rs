// Identity and equality of live objects against the wanted table
use fw_core::{Chain, ChainPolicy, FilterAction, MAX_RULE_NAME_LEN, RuleRef, Set, ValueError};
use std::collections::HashSet;
use tracing::debug;

use crate::compile::{CompileContext, CompileError, compile_rule};
use crate::expr::Expr;
use crate::table::{LiveChain, LiveRule, LiveSetElement};

/// User-data TLV type of a rule comment
const UDATA_RULE_COMMENT: u8 = 0;

/// Encode a rule name as the comment TLV stored in the rule's user data.
pub fn rule_comment(name: &str) -> Result<Vec<u8>, CompileError> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_RULE_NAME_LEN {
        return Err(CompileError::NameTooLong {
            len: bytes.len(),
            max: MAX_RULE_NAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(bytes.len() + 3);
    buf.push(UDATA_RULE_COMMENT);
    buf.push((bytes.len() + 1) as u8);
    buf.extend_from_slice(bytes);
    buf.push(0);
    Ok(buf)
}

/// Recover a rule name from user data; `None` when no usable comment is present.
pub fn rule_name(userdata: &[u8]) -> Option<String> {
    let mut rest = userdata;

    while let [kind, len, tail @ ..] = rest {
        let len = *len as usize;
        if tail.len() < len {
            return None;
        }
        let (value, next) = tail.split_at(len);
        if *kind == UDATA_RULE_COMMENT {
            let text = value.strip_suffix(&[0u8]).unwrap_or(value);
            let name = std::str::from_utf8(text).ok()?;
            return (!name.is_empty()).then(|| name.to_string());
        }
        rest = next;
    }

    None
}

/// Instructions the kernel rewrites, drops or fills in on read-back
pub fn is_unstable(expr: &Expr) -> bool {
    matches!(expr.name(), "counter" | "rt" | "byteorder")
}

/// Order-independent comparison of marshaled instructions, ignoring unstable ones.
pub fn instructions_equal(live: &[Expr], wanted: &[Expr]) -> bool {
    let live: Vec<Vec<u8>> = live
        .iter()
        .filter(|e| !is_unstable(e))
        .map(Expr::marshal)
        .collect();
    let wanted: Vec<Vec<u8>> = wanted
        .iter()
        .filter(|e| !is_unstable(e))
        .map(Expr::marshal)
        .collect();

    if live.len() != wanted.len() {
        return false;
    }

    let wanted: HashSet<&[u8]> = wanted.iter().map(Vec::as_slice).collect();
    live.iter().all(|bytes| wanted.contains(bytes.as_slice()))
}

/// Whether a live rule already implements `wanted`, recompiled for the live rule's family.
pub fn rule_equal(live: &LiveRule, wanted: RuleRef<'_>) -> Result<bool, CompileError> {
    match wanted {
        RuleRef::Route(_) => Ok(true),
        RuleRef::Filter(rule) if rule.action == FilterAction::CtMark => {
            // Read-back of the ct mark write differs structurally from what was added
            debug!(
                chain = %live.chain,
                rule = rule.name.as_deref().unwrap_or_default(),
                "ctmark rule treated as equal once matched by name"
            );
            Ok(true)
        }
        _ => {
            let exprs = compile_rule(wanted, &CompileContext::new(live.family))?;
            Ok(instructions_equal(&live.exprs, &exprs))
        }
    }
}

/// Type, hook and priority must agree; policy is updated in place.
pub fn chain_matches(live: &LiveChain, wanted: &Chain) -> bool {
    live.chain_type == wanted.chain_type
        && live.hook == wanted.hook
        && live.priority == wanted.priority
}

pub fn policy_differs(live: &LiveChain, wanted: &Chain) -> bool {
    live.policy != wanted.policy.unwrap_or(ChainPolicy::Accept)
}

pub fn encode_set_elements(set: &Set) -> Result<Vec<LiveSetElement>, ValueError> {
    set.elements
        .iter()
        .map(|element| {
            let key = set.key_type.encode(&element.key)?;
            let data = match (set.data_type, element.data.as_deref()) {
                (Some(data_type), Some(data)) => Some(data_type.encode(data)?),
                _ => None,
            };
            Ok(LiveSetElement { key, data })
        })
        .collect()
}

/// Exact key/value set equality
pub fn set_elements_equal(live: &[LiveSetElement], wanted: &[LiveSetElement]) -> bool {
    let live: HashSet<&LiveSetElement> = live.iter().collect();
    let wanted: HashSet<&LiveSetElement> = wanted.iter().collect();
    live == wanted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ByteorderOp, CmpOp, NFT_REG_1, RtKey};
    use fw_core::{
        ChainHook, ChainType, Family, FilterRule, L4Proto, Match, MatchOp, PortPosition,
        SetDataType, SetElement,
    };

    fn ssh_rule() -> FilterRule {
        FilterRule {
            name: Some("ssh".into()),
            matches: vec![
                Match::proto(MatchOp::Eq, L4Proto::Tcp),
                Match::port(MatchOp::Eq, "22", PortPosition::Dst),
            ],
            action: FilterAction::Accept,
            value: None,
        }
    }

    fn live(exprs: Vec<Expr>) -> LiveRule {
        LiveRule {
            family: Family::Inet,
            table: "fw".into(),
            chain: "in".into(),
            handle: 4,
            exprs,
            userdata: rule_comment("ssh").unwrap(),
        }
    }

    fn compiled(rule: &FilterRule) -> Vec<Expr> {
        compile_rule(RuleRef::Filter(rule), &CompileContext::new(Family::Inet)).unwrap()
    }

    #[test]
    fn comment_round_trip() {
        let data = rule_comment("fwd-a1b2c3d4").unwrap();
        assert_eq!(data[0], UDATA_RULE_COMMENT);
        assert_eq!(rule_name(&data).as_deref(), Some("fwd-a1b2c3d4"));
    }

    #[test]
    fn comment_found_after_other_tlvs() {
        let mut data = vec![3, 2, 0xde, 0xad];
        data.extend(rule_comment("late").unwrap());
        assert_eq!(rule_name(&data).as_deref(), Some("late"));
    }

    #[test]
    fn overlong_name_is_refused() {
        let longest = "r".repeat(MAX_RULE_NAME_LEN);
        assert_eq!(rule_name(&rule_comment(&longest).unwrap()), Some(longest));

        // Multi-byte characters count by encoded length
        let wide = "é".repeat(MAX_RULE_NAME_LEN / 2 + 1);
        assert_eq!(
            rule_comment(&wide),
            Err(CompileError::NameTooLong {
                len: MAX_RULE_NAME_LEN + 2,
                max: MAX_RULE_NAME_LEN
            })
        );
    }

    #[test]
    fn missing_or_truncated_comment_has_no_name() {
        assert_eq!(rule_name(&[]), None);
        assert_eq!(rule_name(&[0, 10, b'a']), None);
        assert_eq!(rule_name(&[0, 1, 0]), None);
    }

    #[test]
    fn equal_after_fresh_compile() {
        let rule = ssh_rule();
        assert!(rule_equal(&live(compiled(&rule)), RuleRef::Filter(&rule)).unwrap());
    }

    #[test]
    fn unstable_instructions_are_ignored() {
        let rule = ssh_rule();
        let mut exprs = compiled(&rule);
        exprs.insert(
            2,
            Expr::Byteorder {
                sreg: NFT_REG_1,
                dreg: NFT_REG_1,
                op: ByteorderOp::Ntoh,
                len: 2,
                size: 2,
            },
        );
        exprs.push(Expr::Counter {
            bytes: 4096,
            packets: 12,
        });
        exprs.push(Expr::Rt {
            key: RtKey::Tcpmss,
            dreg: NFT_REG_1,
        });

        assert!(rule_equal(&live(exprs), RuleRef::Filter(&rule)).unwrap());
    }

    #[test]
    fn unstable_by_kernel_name_even_when_opaque() {
        let opaque = Expr::Opaque {
            name: "counter".into(),
            data: vec![],
        };
        assert!(is_unstable(&opaque));
        assert!(!is_unstable(&Expr::Opaque {
            name: "log".into(),
            data: vec![],
        }));
    }

    #[test]
    fn reordered_instructions_are_equal() {
        let rule = ssh_rule();
        let mut exprs = compiled(&rule);
        exprs.reverse();
        assert!(rule_equal(&live(exprs), RuleRef::Filter(&rule)).unwrap());
    }

    #[test]
    fn changed_or_extra_instruction_is_not_equal() {
        let rule = ssh_rule();

        let mut changed = compiled(&rule);
        changed[3] = Expr::cmp(CmpOp::Eq, 2222u16.to_be_bytes().to_vec());
        assert!(!rule_equal(&live(changed), RuleRef::Filter(&rule)).unwrap());

        let mut extra = compiled(&rule);
        extra.push(Expr::Masq);
        assert!(!rule_equal(&live(extra), RuleRef::Filter(&rule)).unwrap());
    }

    #[test]
    fn ctmark_rules_equal_by_name() {
        let rule = FilterRule {
            name: Some("mark".into()),
            matches: vec![],
            action: FilterAction::CtMark,
            value: Some("7".into()),
        };
        assert!(rule_equal(&live(vec![Expr::Masq]), RuleRef::Filter(&rule)).unwrap());
    }

    #[test]
    fn chain_identity_ignores_policy() {
        let wanted = Chain {
            policy: Some(ChainPolicy::Drop),
            ..Chain::new("in", ChainType::Filter, ChainHook::Input)
        };
        let mut live = LiveChain {
            family: Family::Inet,
            table: "fw".into(),
            name: "in".into(),
            chain_type: ChainType::Filter,
            hook: ChainHook::Input,
            priority: 0,
            policy: ChainPolicy::Accept,
        };

        assert!(chain_matches(&live, &wanted));
        assert!(policy_differs(&live, &wanted));

        live.priority = 100;
        assert!(!chain_matches(&live, &wanted));
    }

    #[test]
    fn set_elements_compare_as_sets() {
        let set = Set {
            name: "allowed".into(),
            key_type: SetDataType::Ipv4Addr,
            data_type: None,
            elements: vec![
                SetElement {
                    key: "10.0.0.1".into(),
                    data: None,
                },
                SetElement {
                    key: "10.0.0.2".into(),
                    data: None,
                },
            ],
        };
        let wanted = encode_set_elements(&set).unwrap();
        let mut live = wanted.clone();
        live.reverse();
        assert!(set_elements_equal(&live, &wanted));

        live.pop();
        assert!(!set_elements_equal(&live, &wanted));
    }
}
