// In-memory nf_tables: batch/commit semantics over a serialisable state
use anyhow::{Context, Result};
use fw_core::{ChainPolicy, Family};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::conn::NftConn;
use crate::expr::Expr;
use crate::identity::rule_name;
use crate::table::{LiveChain, LiveRule, LiveSet, LiveSetElement, LiveTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    Exists { kind: &'static str, name: String },

    #[error("{kind} is in use: {name}")]
    Busy { kind: &'static str, name: String },

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSet {
    #[serde(flatten)]
    pub set: LiveSet,
    #[serde(default)]
    pub elements: Vec<LiveSetElement>,
}

/// Committed kernel objects. This is the JSON snapshot format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelState {
    #[serde(default)]
    pub tables: Vec<LiveTable>,
    #[serde(default)]
    pub chains: Vec<LiveChain>,
    #[serde(default)]
    pub rules: Vec<LiveRule>,
    #[serde(default)]
    pub sets: Vec<StoredSet>,
    #[serde(default)]
    handle_seq: u64,
}

/// One committed mutation, as recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum Change {
    TableAdded { table: String },
    TableDeleted { table: String },
    ChainAdded { table: String, chain: String },
    ChainUpdated { table: String, chain: String, policy: ChainPolicy },
    ChainDeleted { table: String, chain: String },
    RuleAdded { table: String, chain: String, handle: u64, name: Option<String> },
    RuleDeleted { table: String, chain: String, handle: u64, name: Option<String> },
    SetAdded { table: String, set: String, elements: usize },
    SetDeleted { table: String, set: String },
    ElementsAdded { table: String, set: String, count: usize },
    ElementsDeleted { table: String, set: String, count: usize },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableAdded { table } => write!(f, "+ table {}", table),
            Self::TableDeleted { table } => write!(f, "- table {}", table),
            Self::ChainAdded { table, chain } => write!(f, "+ chain {}/{}", table, chain),
            Self::ChainUpdated {
                table,
                chain,
                policy,
            } => write!(f, "~ chain {}/{} policy {:?}", table, chain, policy),
            Self::ChainDeleted { table, chain } => write!(f, "- chain {}/{}", table, chain),
            Self::RuleAdded {
                table,
                chain,
                handle,
                name,
            } => write!(
                f,
                "+ rule {}/{} #{} {}",
                table,
                chain,
                handle,
                name.as_deref().unwrap_or("<unnamed>")
            ),
            Self::RuleDeleted {
                table,
                chain,
                handle,
                name,
            } => write!(
                f,
                "- rule {}/{} #{} {}",
                table,
                chain,
                handle,
                name.as_deref().unwrap_or("<unnamed>")
            ),
            Self::SetAdded {
                table,
                set,
                elements,
            } => write!(f, "+ set {}/{} ({} elements)", table, set, elements),
            Self::SetDeleted { table, set } => write!(f, "- set {}/{}", table, set),
            Self::ElementsAdded { table, set, count } => {
                write!(f, "+ {} elements in {}/{}", count, table, set)
            }
            Self::ElementsDeleted { table, set, count } => {
                write!(f, "- {} elements in {}/{}", count, table, set)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    AddTable(LiveTable),
    DelTable(LiveTable),
    AddChain(LiveChain),
    DelChain(LiveChain),
    AddRule(LiveRule),
    DelRule(LiveRule),
    AddSet(LiveSet, Vec<LiveSetElement>),
    DelSet(LiveSet),
    AddElements(LiveSet, Vec<LiveSetElement>),
    DelElements(LiveSet, Vec<LiveSetElement>),
}

impl KernelState {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)
            .with_context(|| format!("Failed to write snapshot {}", path.display()))
    }

    /// Read one table and everything in it through `conn`. Empty when the table is absent.
    pub async fn capture<C: NftConn>(conn: &mut C, family: Family, name: &str) -> Result<Self> {
        let mut state = Self::default();
        let tables = conn
            .list_tables(family)
            .await
            .with_context(|| format!("Failed to list {} tables", family))?;
        let Some(table) = tables.into_iter().find(|t| t.name == name) else {
            return Ok(state);
        };

        for chain in conn.list_chains(family).await? {
            if chain.table != table.name {
                continue;
            }
            let rules = conn
                .get_rules(&chain)
                .await
                .with_context(|| format!("Failed to read rules of chain '{}'", chain.name))?;
            state.rules.extend(rules);
            state.chains.push(chain);
        }

        for set in conn.get_sets(&table).await? {
            let elements = conn
                .get_set_elements(&set)
                .await
                .with_context(|| format!("Failed to read elements of set '{}'", set.name))?;
            state.sets.push(StoredSet { set, elements });
        }

        state.handle_seq = state.rules.iter().map(|r| r.handle).max().unwrap_or(0);
        state.tables.push(table);
        debug!(
            table = name,
            chains = state.chains.len(),
            rules = state.rules.len(),
            sets = state.sets.len(),
            "Captured table"
        );
        Ok(state)
    }

    pub fn table(&self, family: Family, name: &str) -> Option<&LiveTable> {
        self.tables
            .iter()
            .find(|t| t.family == family && t.name == name)
    }

    pub fn chain(&self, family: Family, table: &str, name: &str) -> Option<&LiveChain> {
        self.chains
            .iter()
            .find(|c| c.family == family && c.table == table && c.name == name)
    }

    pub fn rules_of(&self, family: Family, table: &str, chain: &str) -> Vec<&LiveRule> {
        self.rules
            .iter()
            .filter(|r| r.family == family && r.table == table && r.chain == chain)
            .collect()
    }

    pub fn set(&self, family: Family, table: &str, name: &str) -> Option<&StoredSet> {
        self.sets
            .iter()
            .find(|s| s.set.family == family && s.set.table == table && s.set.name == name)
    }

    fn set_index(&self, set: &LiveSet) -> Result<usize, KernelError> {
        self.sets
            .iter()
            .position(|s| {
                s.set.family == set.family && s.set.table == set.table && s.set.name == set.name
            })
            .ok_or_else(|| KernelError::NotFound {
                kind: "set",
                name: format!("{}/{}", set.table, set.name),
            })
    }

    fn require_table(&self, family: Family, name: &str) -> Result<(), KernelError> {
        self.table(family, name)
            .map(|_| ())
            .ok_or_else(|| KernelError::NotFound {
                kind: "table",
                name: name.to_string(),
            })
    }

    fn next_handle(&mut self) -> u64 {
        let highest = self.rules.iter().map(|r| r.handle).max().unwrap_or(0);
        self.handle_seq = self.handle_seq.max(highest) + 1;
        self.handle_seq
    }

    fn apply(&mut self, mutation: Mutation) -> Result<Option<Change>, KernelError> {
        match mutation {
            Mutation::AddTable(table) => {
                if self.table(table.family, &table.name).is_some() {
                    return Ok(None);
                }
                let change = Change::TableAdded {
                    table: table.name.clone(),
                };
                self.tables.push(table);
                Ok(Some(change))
            }
            Mutation::DelTable(table) => {
                self.require_table(table.family, &table.name)?;
                let owned = |family: Family, name: &str| family == table.family && name == table.name;
                self.tables.retain(|t| !owned(t.family, &t.name));
                self.chains.retain(|c| !owned(c.family, &c.table));
                self.rules.retain(|r| !owned(r.family, &r.table));
                self.sets.retain(|s| !owned(s.set.family, &s.set.table));
                Ok(Some(Change::TableDeleted { table: table.name }))
            }
            Mutation::AddChain(chain) => {
                self.require_table(chain.family, &chain.table)?;
                let existing = self.chains.iter_mut().find(|c| {
                    c.family == chain.family && c.table == chain.table && c.name == chain.name
                });
                match existing {
                    Some(current)
                        if current.chain_type != chain.chain_type
                            || current.hook != chain.hook
                            || current.priority != chain.priority =>
                    {
                        Err(KernelError::Exists {
                            kind: "chain",
                            name: format!("{}/{}", chain.table, chain.name),
                        })
                    }
                    Some(current) if current.policy == chain.policy => Ok(None),
                    Some(current) => {
                        current.policy = chain.policy;
                        Ok(Some(Change::ChainUpdated {
                            table: chain.table,
                            chain: chain.name,
                            policy: chain.policy,
                        }))
                    }
                    None => {
                        let change = Change::ChainAdded {
                            table: chain.table.clone(),
                            chain: chain.name.clone(),
                        };
                        self.chains.push(chain);
                        Ok(Some(change))
                    }
                }
            }
            Mutation::DelChain(chain) => {
                if self.chain(chain.family, &chain.table, &chain.name).is_none() {
                    return Err(KernelError::NotFound {
                        kind: "chain",
                        name: format!("{}/{}", chain.table, chain.name),
                    });
                }
                let owned = |family: Family, table: &str, name: &str| {
                    family == chain.family && table == chain.table && name == chain.name
                };
                self.chains.retain(|c| !owned(c.family, &c.table, &c.name));
                self.rules.retain(|r| !owned(r.family, &r.table, &r.chain));
                Ok(Some(Change::ChainDeleted {
                    table: chain.table,
                    chain: chain.name,
                }))
            }
            Mutation::AddRule(mut rule) => {
                if self.chain(rule.family, &rule.table, &rule.chain).is_none() {
                    return Err(KernelError::NotFound {
                        kind: "chain",
                        name: format!("{}/{}", rule.table, rule.chain),
                    });
                }
                for expr in &rule.exprs {
                    if let Expr::Lookup { set, .. } = expr {
                        if self.set(rule.family, &rule.table, set).is_none() {
                            return Err(KernelError::NotFound {
                                kind: "set",
                                name: format!("{}/{}", rule.table, set),
                            });
                        }
                    }
                }
                rule.handle = self.next_handle();
                let change = Change::RuleAdded {
                    table: rule.table.clone(),
                    chain: rule.chain.clone(),
                    handle: rule.handle,
                    name: rule_name(&rule.userdata),
                };
                self.rules.push(rule);
                Ok(Some(change))
            }
            Mutation::DelRule(rule) => {
                let index = self
                    .rules
                    .iter()
                    .position(|r| {
                        r.family == rule.family
                            && r.table == rule.table
                            && r.chain == rule.chain
                            && r.handle == rule.handle
                    })
                    .ok_or_else(|| KernelError::NotFound {
                        kind: "rule",
                        name: format!("{}/{}#{}", rule.table, rule.chain, rule.handle),
                    })?;
                let removed = self.rules.remove(index);
                Ok(Some(Change::RuleDeleted {
                    table: removed.table,
                    chain: removed.chain,
                    handle: removed.handle,
                    name: rule_name(&removed.userdata),
                }))
            }
            Mutation::AddSet(set, elements) => {
                self.require_table(set.family, &set.table)?;
                if self.set_index(&set).is_ok() {
                    return Err(KernelError::Exists {
                        kind: "set",
                        name: format!("{}/{}", set.table, set.name),
                    });
                }
                let change = Change::SetAdded {
                    table: set.table.clone(),
                    set: set.name.clone(),
                    elements: elements.len(),
                };
                self.sets.push(StoredSet { set, elements });
                Ok(Some(change))
            }
            Mutation::DelSet(set) => {
                let index = self.set_index(&set)?;
                let referenced = self
                    .rules
                    .iter()
                    .filter(|r| r.family == set.family && r.table == set.table)
                    .flat_map(|r| r.exprs.iter())
                    .any(|e| matches!(e, Expr::Lookup { set: name, .. } if *name == set.name));
                if referenced {
                    return Err(KernelError::Busy {
                        kind: "set",
                        name: format!("{}/{}", set.table, set.name),
                    });
                }
                self.sets.remove(index);
                Ok(Some(Change::SetDeleted {
                    table: set.table,
                    set: set.name,
                }))
            }
            Mutation::AddElements(set, elements) => {
                let index = self.set_index(&set)?;
                let stored = &mut self.sets[index];
                for element in &elements {
                    match stored.elements.iter_mut().find(|e| e.key == element.key) {
                        Some(existing) => existing.data = element.data.clone(),
                        None => stored.elements.push(element.clone()),
                    }
                }
                Ok(Some(Change::ElementsAdded {
                    table: set.table,
                    set: set.name,
                    count: elements.len(),
                }))
            }
            Mutation::DelElements(set, elements) => {
                let index = self.set_index(&set)?;
                let stored = &mut self.sets[index];
                for element in &elements {
                    let position = stored
                        .elements
                        .iter()
                        .position(|e| e.key == element.key)
                        .ok_or_else(|| KernelError::NotFound {
                            kind: "element",
                            name: format!("{}/{} {:?}", set.table, set.name, element.key),
                        })?;
                    stored.elements.remove(position);
                }
                Ok(Some(Change::ElementsDeleted {
                    table: set.table,
                    set: set.name,
                    count: elements.len(),
                }))
            }
        }
    }
}

/// [`NftConn`] backed by an in-process [`KernelState`].
#[derive(Debug, Default)]
pub struct MemoryConn {
    state: KernelState,
    pending: Vec<Mutation>,
    journal: Vec<Change>,
    flushes: usize,
    fail_next_flush: Option<String>,
}

impl MemoryConn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: KernelState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn into_state(self) -> KernelState {
        self.state
    }

    /// Every change committed so far, in commit order
    pub fn journal(&self) -> &[Change] {
        &self.journal
    }

    pub fn take_journal(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.journal)
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Make the next flush fail and discard its batch
    pub fn fail_next_flush(&mut self, reason: &str) {
        self.fail_next_flush = Some(reason.to_string());
    }

    /// Commit a rule directly, as another writer sharing the kernel would.
    pub fn insert_rule(&mut self, mut rule: LiveRule) -> u64 {
        rule.handle = self.state.next_handle();
        let handle = rule.handle;
        self.state.rules.push(rule);
        handle
    }
}

impl NftConn for MemoryConn {
    async fn list_tables(&mut self, family: Family) -> Result<Vec<LiveTable>> {
        Ok(self
            .state
            .tables
            .iter()
            .filter(|t| t.family == family)
            .cloned()
            .collect())
    }

    fn add_table(&mut self, table: &LiveTable) {
        self.pending.push(Mutation::AddTable(table.clone()));
    }

    fn del_table(&mut self, table: &LiveTable) {
        self.pending.push(Mutation::DelTable(table.clone()));
    }

    async fn list_chains(&mut self, family: Family) -> Result<Vec<LiveChain>> {
        Ok(self
            .state
            .chains
            .iter()
            .filter(|c| c.family == family)
            .cloned()
            .collect())
    }

    fn add_chain(&mut self, chain: &LiveChain) {
        self.pending.push(Mutation::AddChain(chain.clone()));
    }

    fn del_chain(&mut self, chain: &LiveChain) {
        self.pending.push(Mutation::DelChain(chain.clone()));
    }

    async fn get_rules(&mut self, chain: &LiveChain) -> Result<Vec<LiveRule>> {
        if self
            .state
            .chain(chain.family, &chain.table, &chain.name)
            .is_none()
        {
            return Err(KernelError::NotFound {
                kind: "chain",
                name: format!("{}/{}", chain.table, chain.name),
            }
            .into());
        }
        Ok(self
            .state
            .rules_of(chain.family, &chain.table, &chain.name)
            .into_iter()
            .cloned()
            .collect())
    }

    fn add_rule(&mut self, rule: &LiveRule) {
        self.pending.push(Mutation::AddRule(rule.clone()));
    }

    fn del_rule(&mut self, rule: &LiveRule) {
        self.pending.push(Mutation::DelRule(rule.clone()));
    }

    async fn get_sets(&mut self, table: &LiveTable) -> Result<Vec<LiveSet>> {
        Ok(self
            .state
            .sets
            .iter()
            .filter(|s| s.set.family == table.family && s.set.table == table.name)
            .map(|s| s.set.clone())
            .collect())
    }

    async fn get_set_elements(&mut self, set: &LiveSet) -> Result<Vec<LiveSetElement>> {
        let index = self.state.set_index(set)?;
        Ok(self.state.sets[index].elements.clone())
    }

    fn add_set(&mut self, set: &LiveSet, elements: &[LiveSetElement]) {
        self.pending
            .push(Mutation::AddSet(set.clone(), elements.to_vec()));
    }

    fn del_set(&mut self, set: &LiveSet) {
        self.pending.push(Mutation::DelSet(set.clone()));
    }

    fn set_add_elements(&mut self, set: &LiveSet, elements: &[LiveSetElement]) {
        self.pending
            .push(Mutation::AddElements(set.clone(), elements.to_vec()));
    }

    fn set_delete_elements(&mut self, set: &LiveSet, elements: &[LiveSetElement]) {
        self.pending
            .push(Mutation::DelElements(set.clone(), elements.to_vec()));
    }

    async fn flush(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        if let Some(reason) = self.fail_next_flush.take() {
            return Err(KernelError::Aborted(reason).into());
        }

        // Apply to a copy so a rejected message leaves the committed state untouched
        let mut next = self.state.clone();
        let mut changes = Vec::new();
        for (index, mutation) in batch.into_iter().enumerate() {
            if let Some(change) = next
                .apply(mutation)
                .with_context(|| format!("batch message {} rejected", index))?
            {
                changes.push(change);
            }
        }

        debug!(changes = changes.len(), "batch committed");
        self.state = next;
        self.journal.extend(changes);
        self.flushes += 1;
        Ok(())
    }
}
