// Reconciliation pass: converge one live table onto its specification
use anyhow::{Context, Result};
use fw_core::{Family, RuleRef, Table};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compile::{CompileContext, CompileError, compile_rule};
use crate::conn::NftConn;
use crate::expr::Expr;
use crate::identity::{
    chain_matches, encode_set_elements, policy_differs, rule_comment, rule_equal, rule_name,
    set_elements_equal,
};
use crate::table::{LiveChain, LiveRule, LiveSet, LiveTable};

/// Counts of the mutations one pass committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub table: String,
    pub family: Option<Family>,
    pub table_created: bool,
    pub chains_deleted: usize,
    pub chains_created: usize,
    pub chains_updated: usize,
    pub rules_deleted: usize,
    pub rules_added: usize,
    pub rules_skipped: usize,
    pub rules_failed: usize,
    pub sets_deleted: usize,
    pub sets_created: usize,
    pub sets_updated: usize,
}

impl ReconcileReport {
    fn new(table: &Table) -> Self {
        Self {
            table: table.name.clone(),
            family: Some(table.family),
            ..Self::default()
        }
    }

    pub fn mutations(&self) -> usize {
        usize::from(self.table_created)
            + self.chains_deleted
            + self.chains_created
            + self.chains_updated
            + self.rules_deleted
            + self.rules_added
            + self.sets_deleted
            + self.sets_created
            + self.sets_updated
    }

    pub fn is_noop(&self) -> bool {
        self.mutations() == 0
    }
}

/// A declared rule that could not be turned into kernel instructions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rule '{rule}' in chain '{chain}': {error}")]
pub struct RuleFailure {
    pub chain: String,
    pub rule: String,
    pub error: CompileError,
}

/// A pass that committed everything except the rules in `failures`.
#[derive(Debug, Clone, Error)]
#[error("{} rule(s) of table '{}' could not be compiled", .failures.len(), .report.table)]
pub struct PartialReconcile {
    pub report: ReconcileReport,
    pub failures: Vec<RuleFailure>,
}

/// Instructions and user data ready to be sent for one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub exprs: Vec<Expr>,
    pub userdata: Vec<u8>,
}

/// Result of compiling every named filter and NAT rule of a table
#[derive(Debug, Clone, Default)]
pub struct CompiledTable {
    /// Keyed by (chain, rule name)
    pub rules: HashMap<(String, String), CompiledRule>,
    pub failures: Vec<RuleFailure>,
}

impl CompiledTable {
    fn failed(&self, chain: &str, rule: &str) -> bool {
        self.failures
            .iter()
            .any(|f| f.chain == chain && f.rule == rule)
    }
}

pub struct Reconciler<'c, C: NftConn> {
    conn: &'c mut C,
}

impl<'c, C: NftConn> Reconciler<'c, C> {
    pub fn new(conn: &'c mut C) -> Self {
        Self { conn }
    }

    /// Run one full read-diff-apply pass for `table`.
    ///
    /// The table must already be admitted (named and validated). A rule that
    /// fails to compile is left out while the rest of the pass still runs;
    /// the pass then ends in a [`PartialReconcile`] error.
    pub async fn reconcile(&mut self, table: &Table) -> Result<ReconcileReport> {
        info!(table = %table.name, family = %table.family, "Starting reconciliation pass");
        let mut report = ReconcileReport::new(table);
        let compiled = compile_table(table);
        for failure in &compiled.failures {
            warn!(chain = %failure.chain, rule = %failure.rule, error = %failure.error, "Rule cannot be compiled");
        }
        let live_table = LiveTable::from_spec(table);

        // Step 1: the table itself
        self.ensure_table(&live_table, &mut report).await?;

        // Step 2: drop outdated chains, rules and retyped sets, then commit
        let retyped = if report.table_created {
            Vec::new()
        } else {
            self.retyped_sets(table, &live_table).await?
        };
        let retyped_names: HashSet<String> = retyped.iter().map(|s| s.name.clone()).collect();

        let surviving = self.delete_outdated_chains(table, &mut report).await?;
        let present = self
            .delete_outdated_rules(table, &surviving, &retyped_names, &mut report)
            .await?;
        for set in &retyped {
            // Every rule looking the set up was deleted above, in the same batch
            debug!(set = %set.name, "Set type changed, deleting before recreation");
            self.conn.del_set(set);
            report.sets_deleted += 1;
        }
        self.conn
            .flush()
            .await
            .with_context(|| format!("Failed to commit deletions for table '{}'", table.name))?;

        // Step 3: sets, ahead of the rules that reference them
        self.sync_sets(table, &live_table, &mut report).await?;

        // Step 4: create what is missing, then commit
        self.ensure_chains(table, &surviving, &mut report);
        self.ensure_rules(table, &present, &compiled, &mut report);
        self.conn
            .flush()
            .await
            .with_context(|| format!("Failed to commit creations for table '{}'", table.name))?;

        info!(
            table = %table.name,
            mutations = report.mutations(),
            chains_deleted = report.chains_deleted,
            chains_created = report.chains_created,
            rules_deleted = report.rules_deleted,
            rules_added = report.rules_added,
            rules_failed = report.rules_failed,
            "Reconciliation pass complete"
        );

        if compiled.failures.is_empty() {
            Ok(report)
        } else {
            Err(PartialReconcile {
                report,
                failures: compiled.failures,
            }
            .into())
        }
    }

    /// Delete a table and everything in it. Returns false if it did not exist.
    pub async fn delete_table(&mut self, family: Family, name: &str) -> Result<bool> {
        let tables = self
            .conn
            .list_tables(family)
            .await
            .with_context(|| format!("Failed to list {} tables", family))?;

        let Some(live) = tables.into_iter().find(|t| t.name == name) else {
            debug!(table = name, "Table already absent");
            return Ok(false);
        };

        self.conn.del_table(&live);
        self.conn
            .flush()
            .await
            .with_context(|| format!("Failed to delete table '{}'", name))?;
        info!(table = name, "Table deleted");
        Ok(true)
    }

    async fn ensure_table(&mut self, table: &LiveTable, report: &mut ReconcileReport) -> Result<()> {
        let tables = self
            .conn
            .list_tables(table.family)
            .await
            .with_context(|| format!("Failed to list {} tables", table.family))?;

        if !tables.iter().any(|t| t.name == table.name) {
            debug!(table = %table.name, "Creating table");
            self.conn.add_table(table);
            report.table_created = true;
        }
        Ok(())
    }

    /// Live sets whose key or data type no longer matches their declaration.
    async fn retyped_sets(&mut self, table: &Table, live_table: &LiveTable) -> Result<Vec<LiveSet>> {
        let live_sets = self
            .conn
            .get_sets(live_table)
            .await
            .with_context(|| format!("Failed to list sets of table '{}'", table.name))?;

        Ok(live_sets
            .into_iter()
            .filter(|live| {
                table.set(&live.name).is_some_and(|wanted| {
                    let target = LiveSet::from_spec(table, wanted);
                    live.key_type != target.key_type || live.data_type != target.data_type
                })
            })
            .collect())
    }

    /// Returns the live chains that survive, by name.
    async fn delete_outdated_chains(
        &mut self,
        table: &Table,
        report: &mut ReconcileReport,
    ) -> Result<HashMap<String, LiveChain>> {
        let live_chains = self
            .conn
            .list_chains(table.family)
            .await
            .with_context(|| format!("Failed to list chains of table '{}'", table.name))?;

        let mut surviving = HashMap::new();
        for live in live_chains.into_iter().filter(|c| c.table == table.name) {
            match table.chain(&live.name) {
                Some(wanted) if chain_matches(&live, wanted) => {
                    debug!(chain = %live.name, "Chain kept");
                    surviving.insert(live.name.clone(), live);
                }
                Some(_) => {
                    debug!(chain = %live.name, "Chain definition changed, deleting");
                    self.conn.del_chain(&live);
                    report.chains_deleted += 1;
                }
                None => {
                    debug!(chain = %live.name, "Chain not in specification, deleting");
                    self.conn.del_chain(&live);
                    report.chains_deleted += 1;
                }
            }
        }

        Ok(surviving)
    }

    /// Returns, per surviving chain, the names of live rules that stay.
    async fn delete_outdated_rules(
        &mut self,
        table: &Table,
        surviving: &HashMap<String, LiveChain>,
        retyped: &HashSet<String>,
        report: &mut ReconcileReport,
    ) -> Result<HashMap<String, HashSet<String>>> {
        let mut present = HashMap::new();

        for (chain_name, live_chain) in surviving {
            let Some(wanted_chain) = table.chain(chain_name) else {
                continue;
            };
            let wanted_rules = wanted_chain.rules.rules();
            let live_rules = self
                .conn
                .get_rules(live_chain)
                .await
                .with_context(|| format!("Failed to read rules of chain '{}'", chain_name))?;

            let kept: &mut HashSet<String> = present.entry(chain_name.clone()).or_default();
            for live in live_rules {
                if let Some(set) = looked_up_set(&live, retyped) {
                    debug!(chain = %chain_name, handle = live.handle, set, "Rule uses a retyped set, deleting");
                    self.conn.del_rule(&live);
                    report.rules_deleted += 1;
                    continue;
                }
                if keep_rule(&live, &wanted_rules, kept) {
                    continue;
                }
                self.conn.del_rule(&live);
                report.rules_deleted += 1;
            }
        }

        Ok(present)
    }

    async fn sync_sets(
        &mut self,
        table: &Table,
        live_table: &LiveTable,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let live_sets = self
            .conn
            .get_sets(live_table)
            .await
            .with_context(|| format!("Failed to list sets of table '{}'", table.name))?;

        for live in &live_sets {
            let Some(wanted) = table.set(&live.name) else {
                debug!(set = %live.name, "Set not in specification, deleting");
                self.conn.del_set(live);
                report.sets_deleted += 1;
                continue;
            };

            let elements = encode_set_elements(wanted)
                .with_context(|| format!("Invalid elements in set '{}'", wanted.name))?;
            let target = LiveSet::from_spec(table, wanted);

            if live.key_type != target.key_type || live.data_type != target.data_type {
                // Retyped after the deletion batch was read; the next pass recreates it
                warn!(set = %live.name, "Set type changed during the pass, leaving it for the next one");
                continue;
            }

            let current = self
                .conn
                .get_set_elements(live)
                .await
                .with_context(|| format!("Failed to read elements of set '{}'", live.name))?;

            if set_elements_equal(&current, &elements) {
                debug!(set = %live.name, "Set kept");
                continue;
            }

            // Replace wholesale rather than patching the difference
            debug!(set = %live.name, old = current.len(), new = elements.len(), "Replacing set elements");
            if !current.is_empty() {
                self.conn.set_delete_elements(live, &current);
            }
            if !elements.is_empty() {
                self.conn.set_add_elements(live, &elements);
            }
            report.sets_updated += 1;
        }

        for wanted in &table.sets {
            if live_sets.iter().any(|s| s.name == wanted.name) {
                continue;
            }
            let elements = encode_set_elements(wanted)
                .with_context(|| format!("Invalid elements in set '{}'", wanted.name))?;
            debug!(set = %wanted.name, elements = elements.len(), "Creating set");
            self.conn.add_set(&LiveSet::from_spec(table, wanted), &elements);
            report.sets_created += 1;
        }

        Ok(())
    }

    fn ensure_chains(
        &mut self,
        table: &Table,
        surviving: &HashMap<String, LiveChain>,
        report: &mut ReconcileReport,
    ) {
        for chain in &table.chains {
            match surviving.get(&chain.name) {
                None => {
                    debug!(chain = %chain.name, "Creating chain");
                    self.conn.add_chain(&LiveChain::from_spec(table, chain));
                    report.chains_created += 1;
                }
                Some(live) if policy_differs(live, chain) => {
                    debug!(chain = %chain.name, "Updating chain policy");
                    self.conn.add_chain(&LiveChain::from_spec(table, chain));
                    report.chains_updated += 1;
                }
                Some(_) => {}
            }
        }
    }

    fn ensure_rules(
        &mut self,
        table: &Table,
        present: &HashMap<String, HashSet<String>>,
        compiled: &CompiledTable,
        report: &mut ReconcileReport,
    ) {
        for chain in &table.chains {
            let kept = present.get(&chain.name);

            for rule in chain.rules.rules() {
                let Some(name) = rule.name() else {
                    continue;
                };
                if kept.is_some_and(|k| k.contains(name)) {
                    continue;
                }

                if compiled.failed(&chain.name, name) {
                    report.rules_failed += 1;
                    continue;
                }
                let Some(rule) = compiled.rules.get(&(chain.name.clone(), name.to_string())) else {
                    warn!(chain = %chain.name, rule = name, "Skipping rule that cannot be compiled yet");
                    report.rules_skipped += 1;
                    continue;
                };

                debug!(chain = %chain.name, rule = name, "Adding rule");
                self.conn.add_rule(&LiveRule {
                    family: table.family,
                    table: table.name.clone(),
                    chain: chain.name.clone(),
                    handle: 0,
                    exprs: rule.exprs.clone(),
                    userdata: rule.userdata.clone(),
                });
                report.rules_added += 1;
            }
        }
    }
}

/// Decide whether a live rule stays; the names of kept rules accumulate in `kept`.
fn keep_rule(live: &LiveRule, wanted: &[RuleRef<'_>], kept: &mut HashSet<String>) -> bool {
    let Some(name) = rule_name(&live.userdata) else {
        warn!(chain = %live.chain, handle = live.handle, "Deleting live rule without a name");
        return false;
    };

    let Some(rule) = wanted.iter().find(|r| r.name() == Some(name.as_str())) else {
        debug!(chain = %live.chain, rule = %name, "Rule not in specification, deleting");
        return false;
    };

    if kept.contains(&name) {
        debug!(chain = %live.chain, rule = %name, "Duplicate live rule, deleting");
        return false;
    }

    match rule_equal(live, *rule) {
        Ok(true) => {
            debug!(chain = %live.chain, rule = %name, "Rule kept");
            kept.insert(name);
            true
        }
        Ok(false) => {
            debug!(chain = %live.chain, rule = %name, "Rule outdated, deleting");
            false
        }
        Err(err) => {
            debug!(chain = %live.chain, rule = %name, error = %err, "Rule not comparable, deleting");
            false
        }
    }
}

/// First set in `sets` the rule looks up, if any
fn looked_up_set<'a>(rule: &'a LiveRule, sets: &HashSet<String>) -> Option<&'a str> {
    rule.exprs.iter().find_map(|expr| match expr {
        Expr::Lookup { set, .. } if sets.contains(set) => Some(set.as_str()),
        _ => None,
    })
}

/// Compile every named filter and NAT rule of `table`. Route rules are left out.
pub fn compile_table(table: &Table) -> CompiledTable {
    let ctx = CompileContext::new(table.family);
    let mut compiled = CompiledTable::default();

    for chain in &table.chains {
        for rule in chain.rules.rules() {
            let (RuleRef::Filter(_) | RuleRef::Nat(_)) = rule else {
                continue;
            };
            let Some(name) = rule.name() else {
                continue;
            };
            let result = compile_rule(rule, &ctx)
                .and_then(|exprs| Ok(CompiledRule { exprs, userdata: rule_comment(name)? }));
            match result {
                Ok(rule) => {
                    compiled
                        .rules
                        .insert((chain.name.clone(), name.to_string()), rule);
                }
                Err(error) => compiled.failures.push(RuleFailure {
                    chain: chain.name.clone(),
                    rule: name.to_string(),
                    error,
                }),
            }
        }
    }

    compiled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConn;
    use fw_core::{
        Chain, ChainHook, ChainPolicy, ChainType, FilterAction, FilterRule, L4Proto, Match,
        MatchOp, PortPosition, RulesSet,
    };

    fn allow(name: &str, port: &str) -> FilterRule {
        FilterRule {
            name: Some(name.into()),
            matches: vec![
                Match::proto(MatchOp::Eq, L4Proto::Tcp),
                Match::port(MatchOp::Eq, port, PortPosition::Dst),
            ],
            action: FilterAction::Accept,
            value: None,
        }
    }

    fn wanted(rules: Vec<FilterRule>) -> Table {
        let mut chain = Chain::new("in", ChainType::Filter, ChainHook::Input);
        chain.policy = Some(ChainPolicy::Drop);
        chain.rules = RulesSet::filter(rules);

        let mut table = Table::new("fw", Family::Inet);
        table.chains.push(chain);
        table
    }

    #[tokio::test]
    async fn first_pass_creates_everything() {
        let mut conn = MemoryConn::new();
        let table = wanted(vec![allow("ssh", "22"), allow("https", "443")]);

        let report = Reconciler::new(&mut conn).reconcile(&table).await.unwrap();
        assert!(report.table_created);
        assert_eq!(report.chains_created, 1);
        assert_eq!(report.rules_added, 2);

        let names: Vec<String> = conn
            .state()
            .rules
            .iter()
            .filter_map(|r| rule_name(&r.userdata))
            .collect();
        assert_eq!(names, vec!["ssh", "https"]);
        assert_eq!(conn.flushes(), 2);
    }

    #[tokio::test]
    async fn changed_rule_is_replaced() {
        let mut conn = MemoryConn::new();
        Reconciler::new(&mut conn)
            .reconcile(&wanted(vec![allow("ssh", "22")]))
            .await
            .unwrap();

        let report = Reconciler::new(&mut conn)
            .reconcile(&wanted(vec![allow("ssh", "2222")]))
            .await
            .unwrap();
        assert_eq!(report.rules_deleted, 1);
        assert_eq!(report.rules_added, 1);
        assert_eq!(report.chains_deleted, 0);
    }

    #[tokio::test]
    async fn compile_failure_skips_only_that_rule() {
        let mut conn = MemoryConn::new();
        let table = wanted(vec![allow("bad", "http"), allow("ssh", "22")]);

        let err = Reconciler::new(&mut conn).reconcile(&table).await.unwrap_err();
        let partial = err.downcast_ref::<PartialReconcile>().unwrap();
        assert_eq!(partial.failures.len(), 1);
        assert_eq!(partial.failures[0].rule, "bad");
        assert_eq!(partial.report.rules_failed, 1);
        assert_eq!(partial.report.rules_added, 1);
        assert!(err.to_string().contains("could not be compiled"));

        assert_eq!(conn.flushes(), 2);
        let names: Vec<String> = conn
            .state()
            .rules
            .iter()
            .filter_map(|r| rule_name(&r.userdata))
            .collect();
        assert_eq!(names, vec!["ssh"]);
    }

    #[test]
    fn overlong_name_is_a_rule_failure() {
        let table = wanted(vec![allow(&"n".repeat(200), "22"), allow("ssh", "22")]);
        let compiled = compile_table(&table);
        assert_eq!(compiled.rules.len(), 1);
        assert!(matches!(
            compiled.failures[0].error,
            CompileError::NameTooLong { len: 200, .. }
        ));
    }

    #[tokio::test]
    async fn delete_table_reports_absence() {
        let mut conn = MemoryConn::new();
        let table = wanted(vec![allow("ssh", "22")]);
        Reconciler::new(&mut conn).reconcile(&table).await.unwrap();

        let mut reconciler = Reconciler::new(&mut conn);
        assert!(reconciler.delete_table(Family::Inet, "fw").await.unwrap());
        assert!(!reconciler.delete_table(Family::Inet, "fw").await.unwrap());
        assert!(conn.state().chains.is_empty());
        assert!(conn.state().rules.is_empty());
    }
}
