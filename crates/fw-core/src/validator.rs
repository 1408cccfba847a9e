use std::collections::HashSet;
use thiserror::Error;

use crate::model::{
    Chain, ChainHook, ChainType, Family, FilterAction, FilterRule, L4Proto, MatchKind, MatchOp,
    NatRule, NatType, SetDataType, Table,
};
use crate::value::{IpValue, PortValue, check_ifname};

/// Rule names travel as nftables rule comments, which the kernel caps at 128 bytes
pub const MAX_RULE_NAME_LEN: usize = 128;

/// Validates a table specification before it is admitted
pub struct TableValidator<'a> {
    table: &'a Table,
    previous: Option<&'a Table>,
    siblings: &'a [Table],
}

impl<'a> TableValidator<'a> {
    pub fn new(table: &'a Table) -> Self {
        Self {
            table,
            previous: None,
            siblings: &[],
        }
    }

    /// Previously admitted version of the same specification (update path)
    pub fn with_previous(mut self, previous: &'a Table) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Other specifications visible in the same scope
    pub fn with_siblings(mut self, siblings: &'a [Table]) -> Self {
        self.siblings = siblings;
        self
    }

    /// Run all validations
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // Table identity
        errors.extend(self.check_table_name_immutable());
        errors.extend(self.check_table_name_unique());

        // Chain structure
        errors.extend(self.check_chain_names());
        errors.extend(self.check_chain_hooks());
        errors.extend(self.check_rule_kinds());

        // Rules
        errors.extend(self.check_rule_names());
        errors.extend(self.check_nat_rules());
        errors.extend(self.check_filter_actions());
        errors.extend(self.check_match_values());

        // Sets
        errors.extend(self.check_sets());

        errors
    }

    /// Run all validations, failing on the first report with any error
    pub fn check(&self) -> Result<(), ValidationErrors> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    fn check_table_name_immutable(&self) -> Vec<ValidationError> {
        match self.previous {
            Some(previous) if previous.name != self.table.name => {
                vec![ValidationError::TableRenamed {
                    previous: previous.name.clone(),
                    current: self.table.name.clone(),
                }]
            }
            _ => vec![],
        }
    }

    fn check_table_name_unique(&self) -> Vec<ValidationError> {
        if self.siblings.iter().any(|s| s.name == self.table.name) {
            vec![ValidationError::TableNameTaken {
                table: self.table.name.clone(),
            }]
        } else {
            vec![]
        }
    }

    fn check_chain_names(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for chain in &self.table.chains {
            if chain.name.is_empty() {
                errors.push(ValidationError::UnnamedChain);
            } else if !seen.insert(chain.name.as_str()) {
                errors.push(ValidationError::DuplicateChain {
                    chain: chain.name.clone(),
                });
            }
        }

        errors
    }

    /// Check family x type x hook against the netfilter compatibility matrix
    fn check_chain_hooks(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for chain in &self.table.chains {
            if !is_legal_hook(self.table.family, chain.chain_type, chain.hook) {
                errors.push(ValidationError::IllegalHook {
                    chain: chain.name.clone(),
                    family: self.table.family,
                    chain_type: chain.chain_type,
                    hook: chain.hook,
                });
            }

            if chain.policy.is_some() && chain.chain_type != ChainType::Filter {
                errors.push(ValidationError::PolicyOnNonFilter {
                    chain: chain.name.clone(),
                    chain_type: chain.chain_type,
                });
            }
        }

        errors
    }

    fn check_rule_kinds(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for chain in &self.table.chains {
            let kinds = chain.rules.populated_kinds();
            match kinds.as_slice() {
                [] => {}
                [kind] if *kind == chain.chain_type => {}
                [kind] => errors.push(ValidationError::RuleKindMismatch {
                    chain: chain.name.clone(),
                    chain_type: chain.chain_type,
                    rules: *kind,
                }),
                _ => errors.push(ValidationError::MultipleRuleKinds {
                    chain: chain.name.clone(),
                }),
            }
        }

        errors
    }

    fn check_rule_names(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for chain in &self.table.chains {
            let mut seen = HashSet::new();
            for (index, rule) in chain.rules.rules().iter().enumerate() {
                match rule.name() {
                    None | Some("") => errors.push(ValidationError::UnnamedRule {
                        chain: chain.name.clone(),
                        index,
                    }),
                    Some(name) if name.len() > MAX_RULE_NAME_LEN => {
                        errors.push(ValidationError::RuleNameTooLong {
                            chain: chain.name.clone(),
                            rule: name.to_string(),
                        })
                    }
                    Some(name) => {
                        if !seen.insert(name) {
                            errors.push(ValidationError::DuplicateRule {
                                chain: chain.name.clone(),
                                rule: name.to_string(),
                            });
                        }
                    }
                }
            }
        }

        errors
    }

    /// NAT direction vs. hook and presence of the `to` target
    fn check_nat_rules(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for chain in &self.table.chains {
            for (index, rule) in chain.rules.nat_rules.iter().flatten().enumerate() {
                let label = rule_label(rule.name.as_deref(), index);

                if chain.chain_type == ChainType::Nat && !nat_hook_allowed(rule.nat_type, chain.hook)
                {
                    errors.push(ValidationError::NatHookMismatch {
                        chain: chain.name.clone(),
                        rule: label.clone(),
                        nat_type: rule.nat_type,
                        hook: chain.hook,
                    });
                }

                errors.extend(check_nat_target(self.table.family, chain, rule, &label));
            }
        }

        errors
    }

    fn check_filter_actions(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for chain in &self.table.chains {
            for (index, rule) in chain.rules.filter_rules.iter().flatten().enumerate() {
                let label = rule_label(rule.name.as_deref(), index);

                if let Err(reason) = parse_action_value(rule) {
                    errors.push(ValidationError::InvalidActionValue {
                        chain: chain.name.clone(),
                        rule: label.clone(),
                        action: rule.action,
                        reason,
                    });
                }

                if rule.action == FilterAction::TcpMssClamp && !matches_tcp(rule) {
                    errors.push(ValidationError::MssClampWithoutTcp {
                        chain: chain.name.clone(),
                        rule: label,
                    });
                }
            }
        }

        errors
    }

    fn check_match_values(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for chain in &self.table.chains {
            for (index, rule) in chain.rules.rules().iter().enumerate() {
                let label = rule_label(rule.name(), index);
                for m in rule.matches() {
                    if let Err(reason) = self.check_match(m.kind(), m.populated()) {
                        errors.push(ValidationError::InvalidMatch {
                            chain: chain.name.clone(),
                            rule: label.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        errors
    }

    fn check_match(&self, kind: Option<MatchKind<'_>>, populated: usize) -> Result<(), String> {
        let Some(kind) = kind else {
            return Err(format!(
                "exactly one of ip, port, dev, proto must be set ({} set)",
                populated
            ));
        };

        match kind {
            MatchKind::Ip(ip) => {
                let value: IpValue = ip.value.parse().map_err(|e| format!("{}", e))?;
                match value {
                    IpValue::Void => Err("ip value is empty".to_string()),
                    IpValue::SetRef(_) if self.table.family == Family::Ipv6 => Err(format!(
                        "set lookups match IPv4 addresses and cannot be used in an {} table",
                        self.table.family
                    )),
                    IpValue::SetRef(name) => match self.table.set(&name) {
                        Some(set) if set.key_type == SetDataType::Ipv4Addr => Ok(()),
                        Some(set) => Err(format!(
                            "set '{}' has key type {}, expected ipv4_addr",
                            name, set.key_type
                        )),
                        None => Err(format!("set '{}' does not exist in table", name)),
                    },
                    addr => check_address_family(self.table.family, &addr),
                }
            }
            MatchKind::Port(port) => port
                .value
                .parse::<PortValue>()
                .map(|_| ())
                .map_err(|e| format!("{}", e)),
            MatchKind::Dev(dev) => check_ifname(&dev.value).map_err(|e| format!("{}", e)),
            MatchKind::Proto(_) => Ok(()),
        }
    }

    fn check_sets(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for set in &self.table.sets {
            if !seen.insert(set.name.as_str()) {
                errors.push(ValidationError::DuplicateSet {
                    set: set.name.clone(),
                });
            }

            for element in &set.elements {
                if let Err(e) = set.key_type.encode(&element.key) {
                    errors.push(ValidationError::InvalidSetElement {
                        set: set.name.clone(),
                        key: element.key.clone(),
                        reason: e.to_string(),
                    });
                }

                match (set.data_type, &element.data) {
                    (Some(data_type), Some(data)) => {
                        if let Err(e) = data_type.encode(data) {
                            errors.push(ValidationError::InvalidSetElement {
                                set: set.name.clone(),
                                key: element.key.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                    (Some(_), None) => errors.push(ValidationError::SetDataMissing {
                        set: set.name.clone(),
                        key: element.key.clone(),
                    }),
                    (None, Some(_)) => errors.push(ValidationError::SetDataUnexpected {
                        set: set.name.clone(),
                        key: element.key.clone(),
                    }),
                    (None, None) => {}
                }
            }
        }

        errors
    }
}

/// netfilter's family x chain type x hook compatibility matrix
pub fn is_legal_hook(family: Family, chain_type: ChainType, hook: ChainHook) -> bool {
    use ChainHook::*;

    match (family, chain_type) {
        (Family::Inet, ChainType::Filter) => {
            matches!(hook, Prerouting | Input | Forward | Output | Postrouting | Ingress)
        }
        (Family::Ipv4 | Family::Ipv6, ChainType::Filter) => {
            matches!(hook, Prerouting | Input | Forward | Output | Postrouting)
        }
        (Family::Inet | Family::Ipv4 | Family::Ipv6, ChainType::Nat) => {
            matches!(hook, Prerouting | Input | Output | Postrouting)
        }
        (Family::Inet | Family::Ipv4 | Family::Ipv6, ChainType::Route) => hook == Output,
        (Family::Arp, ChainType::Filter) => matches!(hook, Input | Output),
        (Family::Bridge, ChainType::Filter) => {
            matches!(hook, Prerouting | Input | Forward | Output | Postrouting)
        }
        (Family::Netdev, ChainType::Filter) => hook == Ingress,
        (Family::Arp | Family::Bridge | Family::Netdev, _) => false,
    }
}

/// dnat rewrites before routing, snat/masquerade after it
pub fn nat_hook_allowed(nat_type: NatType, hook: ChainHook) -> bool {
    match nat_type {
        NatType::Dnat => matches!(hook, ChainHook::Prerouting | ChainHook::Output),
        NatType::Snat | NatType::Masquerade => {
            matches!(hook, ChainHook::Postrouting | ChainHook::Input)
        }
    }
}

fn check_nat_target(
    family: Family,
    chain: &Chain,
    rule: &NatRule,
    label: &str,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    match (rule.nat_type, &rule.to) {
        (NatType::Masquerade, Some(_)) => errors.push(ValidationError::NatTargetForbidden {
            chain: chain.name.clone(),
            rule: label.to_string(),
        }),
        (NatType::Masquerade, None) => {}
        (nat_type, None) => errors.push(ValidationError::NatTargetMissing {
            chain: chain.name.clone(),
            rule: label.to_string(),
            nat_type,
        }),
        (_, Some(to)) => {
            let reason = match to.parse::<IpValue>() {
                Ok(addr @ (IpValue::Addr(_) | IpValue::Subnet(_) | IpValue::Range(..))) => {
                    check_address_family(family, &addr).err()
                }
                Ok(other) => Some(format!("{} is not a valid NAT target", other.kind())),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = reason {
                errors.push(ValidationError::InvalidNatTarget {
                    chain: chain.name.clone(),
                    rule: label.to_string(),
                    reason,
                });
            }
        }
    }

    errors
}

/// The compiler loads addresses at family-specific header offsets, so the
/// IP version of a literal has to fit the table.
fn check_address_family(family: Family, value: &IpValue) -> Result<(), String> {
    let addr = match value {
        IpValue::Addr(addr) | IpValue::Range(addr, _) => *addr,
        IpValue::Subnet(net) => net.addr(),
        IpValue::Void | IpValue::SetRef(_) => return Ok(()),
    };

    if family.carries(&addr) {
        Ok(())
    } else {
        Err(format!("address {} cannot be matched in an {} table", addr, family))
    }
}

fn parse_action_value(rule: &FilterRule) -> Result<(), String> {
    let value = rule.value.as_deref().map(str::trim);
    match rule.action {
        FilterAction::CtMark => match value {
            Some(v) => parse_mark(v).map(|_| ()),
            None => Err("ctmark requires a mark value".to_string()),
        },
        FilterAction::TcpMssClamp => match value {
            Some(v) => v
                .parse::<u16>()
                .map(|_| ())
                .map_err(|_| format!("'{}' is not a valid MSS", v)),
            None => Err("tcpmssclamp requires an MSS value".to_string()),
        },
        FilterAction::SetMetaMarkFromCtMark | FilterAction::Accept | FilterAction::Drop => Ok(()),
    }
}

/// Parse a 32-bit mark written in decimal or 0x-prefixed hex
pub fn parse_mark(value: &str) -> Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("'{}' is not a valid 32-bit mark", value))
}

fn matches_tcp(rule: &FilterRule) -> bool {
    rule.matches.iter().any(|m| {
        m.op == MatchOp::Eq
            && m.proto
                .as_ref()
                .is_some_and(|p| p.value == L4Proto::Tcp)
    })
}

fn rule_label(name: Option<&str>, index: usize) -> String {
    match name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("#{}", index),
    }
}

/// Reasons a specification is rejected at admission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("table name is immutable: '{previous}' cannot become '{current}'")]
    TableRenamed { previous: String, current: String },

    #[error("table name '{table}' is already used by another specification in scope")]
    TableNameTaken { table: String },

    #[error("chain name must not be empty")]
    UnnamedChain,

    #[error("chain '{chain}' is declared more than once")]
    DuplicateChain { chain: String },

    #[error("chain '{chain}': {chain_type} chains cannot use hook {hook} in family {family}")]
    IllegalHook {
        chain: String,
        family: Family,
        chain_type: ChainType,
        hook: ChainHook,
    },

    #[error("chain '{chain}': policy is only allowed on filter chains, not {chain_type}")]
    PolicyOnNonFilter { chain: String, chain_type: ChainType },

    #[error("chain '{chain}': only one of natRules, filterRules, routeRules may be set")]
    MultipleRuleKinds { chain: String },

    #[error("chain '{chain}': {rules} rules do not belong in a {chain_type} chain")]
    RuleKindMismatch {
        chain: String,
        chain_type: ChainType,
        rules: ChainType,
    },

    #[error("chain '{chain}': rule {index} has no name")]
    UnnamedRule { chain: String, index: usize },

    #[error("chain '{chain}': rule name '{rule}' exceeds {MAX_RULE_NAME_LEN} bytes")]
    RuleNameTooLong { chain: String, rule: String },

    #[error("chain '{chain}': rule name '{rule}' is used more than once")]
    DuplicateRule { chain: String, rule: String },

    #[error("chain '{chain}', rule '{rule}': {nat_type} is not allowed on hook {hook}")]
    NatHookMismatch {
        chain: String,
        rule: String,
        nat_type: NatType,
        hook: ChainHook,
    },

    #[error("chain '{chain}', rule '{rule}': {nat_type} requires a 'to' target")]
    NatTargetMissing {
        chain: String,
        rule: String,
        nat_type: NatType,
    },

    #[error("chain '{chain}', rule '{rule}': masquerade does not take a 'to' target")]
    NatTargetForbidden { chain: String, rule: String },

    #[error("chain '{chain}', rule '{rule}': invalid NAT target: {reason}")]
    InvalidNatTarget {
        chain: String,
        rule: String,
        reason: String,
    },

    #[error("chain '{chain}', rule '{rule}': invalid value for {action}: {reason}")]
    InvalidActionValue {
        chain: String,
        rule: String,
        action: FilterAction,
        reason: String,
    },

    #[error("chain '{chain}', rule '{rule}': tcpmssclamp requires an 'eq' match on proto tcp")]
    MssClampWithoutTcp { chain: String, rule: String },

    #[error("chain '{chain}', rule '{rule}': invalid match: {reason}")]
    InvalidMatch {
        chain: String,
        rule: String,
        reason: String,
    },

    #[error("set '{set}' is declared more than once")]
    DuplicateSet { set: String },

    #[error("set '{set}', element '{key}': {reason}")]
    InvalidSetElement {
        set: String,
        key: String,
        reason: String,
    },

    #[error("set '{set}', element '{key}': data is required because the set has a data type")]
    SetDataMissing { set: String, key: String },

    #[error("set '{set}', element '{key}': data is not allowed because the set has no data type")]
    SetDataUnexpected { set: String, key: String },
}

/// All errors from one validation run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} validation error(s): {}", .0.len(), join_errors(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
