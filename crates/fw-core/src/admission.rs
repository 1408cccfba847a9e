use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::model::Table;
use crate::validator::{TableValidator, ValidationErrors};

const GENERATED_SUFFIX_LEN: usize = 8;

/// Give every unnamed rule a generated name unique within its chain.
/// Returns the number of names assigned.
pub fn assign_rule_names(table: &mut Table) -> usize {
    let mut assigned = 0;

    for chain in &mut table.chains {
        let chain_name = chain.name.clone();
        let mut taken: HashSet<String> = chain
            .rules
            .rules()
            .iter()
            .filter_map(|r| r.name())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();

        for name in chain.rules.names_mut() {
            if name.as_deref().is_some_and(|n| !n.is_empty()) {
                continue;
            }

            let generated = loop {
                let candidate = generate_rule_name(&chain_name);
                if taken.insert(candidate.clone()) {
                    break candidate;
                }
            };

            debug!(chain = %chain_name, rule = %generated, "assigned generated rule name");
            *name = Some(generated);
            assigned += 1;
        }
    }

    assigned
}

fn generate_rule_name(chain: &str) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}-{}", chain, suffix.to_lowercase())
}

/// Outcome of reviewing a specification write
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// The (possibly renamed) table to persist
    Allowed { table: Table, named: usize },
    Denied(ValidationErrors),
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Admission gate: name unnamed rules, then run the full validator.
pub struct Admission<'a> {
    siblings: &'a [Table],
}

impl<'a> Admission<'a> {
    /// `siblings` are the other specifications visible in the same scope
    pub fn new(siblings: &'a [Table]) -> Self {
        Self { siblings }
    }

    pub fn review_create(&self, table: Table) -> AdmissionDecision {
        self.review(None, table)
    }

    pub fn review_update(&self, previous: &Table, table: Table) -> AdmissionDecision {
        self.review(Some(previous), table)
    }

    fn review(&self, previous: Option<&Table>, mut table: Table) -> AdmissionDecision {
        let named = assign_rule_names(&mut table);

        let mut validator = TableValidator::new(&table).with_siblings(self.siblings);
        if let Some(previous) = previous {
            validator = validator.with_previous(previous);
        }

        match validator.check() {
            Ok(()) => {
                info!(table = %table.name, named, "specification admitted");
                AdmissionDecision::Allowed { table, named }
            }
            Err(errors) => {
                warn!(table = %table.name, "specification denied: {}", errors);
                AdmissionDecision::Denied(errors)
            }
        }
    }
}
