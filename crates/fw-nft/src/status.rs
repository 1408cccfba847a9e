// Live object counts for a table, read through any transport
use anyhow::{Context, Result};
use fw_core::Family;
use serde::Serialize;

use crate::conn::NftConn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub name: String,
    pub family: Family,
    pub chains: usize,
    pub rules: usize,
    pub sets: usize,
    pub elements: usize,
}

pub struct StatusCollector;

impl StatusCollector {
    pub fn new() -> Self {
        Self
    }

    /// `None` when the table does not exist
    pub async fn collect_table_status<C: NftConn>(
        &self,
        conn: &mut C,
        family: Family,
        name: &str,
    ) -> Result<Option<TableStatus>> {
        let tables = conn.list_tables(family).await?;
        let Some(table) = tables.into_iter().find(|t| t.name == name) else {
            return Ok(None);
        };

        let chains: Vec<_> = conn
            .list_chains(family)
            .await?
            .into_iter()
            .filter(|c| c.table == name)
            .collect();

        let mut rules = 0;
        for chain in &chains {
            rules += conn
                .get_rules(chain)
                .await
                .with_context(|| format!("Failed to count rules of chain '{}'", chain.name))?
                .len();
        }

        let sets = conn.get_sets(&table).await?;
        let mut elements = 0;
        for set in &sets {
            elements += conn.get_set_elements(set).await?.len();
        }

        Ok(Some(TableStatus {
            name: table.name,
            family,
            chains: chains.len(),
            rules,
            sets: sets.len(),
            elements,
        }))
    }
}

impl Default for StatusCollector {
    fn default() -> Self {
        Self::new()
    }
}
