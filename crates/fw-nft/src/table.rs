// Kernel-side objects as read back from (or written to) nf_tables
use fw_core::{Chain, ChainHook, ChainPolicy, ChainType, Family, Set, SetDataType, Table};
use serde::{Deserialize, Serialize};

use crate::expr::Expr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTable {
    pub family: Family,
    pub name: String,
}

impl LiveTable {
    pub fn from_spec(table: &Table) -> Self {
        Self {
            family: table.family,
            name: table.name.clone(),
        }
    }
}

/// Base chain. The kernel always reports a policy for base chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveChain {
    pub family: Family,
    pub table: String,
    pub name: String,
    #[serde(rename = "type")]
    pub chain_type: ChainType,
    pub hook: ChainHook,
    pub priority: i32,
    pub policy: ChainPolicy,
}

impl LiveChain {
    /// Chain as it should be created for `chain`; an unset policy means accept
    pub fn from_spec(table: &Table, chain: &Chain) -> Self {
        Self {
            family: table.family,
            table: table.name.clone(),
            name: chain.name.clone(),
            chain_type: chain.chain_type,
            hook: chain.hook,
            priority: chain.priority,
            policy: chain.policy.unwrap_or(ChainPolicy::Accept),
        }
    }

    pub fn hooknum(&self) -> u32 {
        self.hook.hooknum(self.family)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRule {
    pub family: Family,
    pub table: String,
    pub chain: String,
    /// Kernel-assigned; zero for a rule not yet committed
    #[serde(default)]
    pub handle: u64,
    pub exprs: Vec<Expr>,
    /// Opaque user data; carries the rule's name as a comment TLV
    #[serde(default)]
    pub userdata: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSet {
    pub family: Family,
    pub table: String,
    pub name: String,
    pub key_type: SetDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<SetDataType>,
}

impl LiveSet {
    pub fn from_spec(table: &Table, set: &Set) -> Self {
        Self {
            family: table.family,
            table: table.name.clone(),
            name: set.name.clone(),
            key_type: set.key_type,
            data_type: set.data_type,
        }
    }

    pub fn is_map(&self) -> bool {
        self.data_type.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LiveSetElement {
    pub key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}
