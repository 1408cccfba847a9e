use anyhow::Result;
use fw_core::Family;

use crate::table::{LiveChain, LiveRule, LiveSet, LiveSetElement, LiveTable};

/// Primitive nf_tables operations the reconciler depends on.
///
/// Reads go to the kernel immediately. Mutations are queued into a batch
/// and become visible only when [`NftConn::flush`] commits it; a failed
/// flush commits nothing and discards the batch.
#[allow(async_fn_in_trait)]
pub trait NftConn {
    async fn list_tables(&mut self, family: Family) -> Result<Vec<LiveTable>>;

    fn add_table(&mut self, table: &LiveTable);

    fn del_table(&mut self, table: &LiveTable);

    /// All chains of `family`, across every table
    async fn list_chains(&mut self, family: Family) -> Result<Vec<LiveChain>>;

    /// Create the chain, or update its policy when it already exists with the
    /// same type, hook and priority
    fn add_chain(&mut self, chain: &LiveChain);

    /// Deleting a chain also deletes its rules
    fn del_chain(&mut self, chain: &LiveChain);

    async fn get_rules(&mut self, chain: &LiveChain) -> Result<Vec<LiveRule>>;

    /// Append to the end of the rule's chain
    fn add_rule(&mut self, rule: &LiveRule);

    /// Delete by handle
    fn del_rule(&mut self, rule: &LiveRule);

    async fn get_sets(&mut self, table: &LiveTable) -> Result<Vec<LiveSet>>;

    async fn get_set_elements(&mut self, set: &LiveSet) -> Result<Vec<LiveSetElement>>;

    fn add_set(&mut self, set: &LiveSet, elements: &[LiveSetElement]);

    fn del_set(&mut self, set: &LiveSet);

    fn set_add_elements(&mut self, set: &LiveSet, elements: &[LiveSetElement]);

    fn set_delete_elements(&mut self, set: &LiveSet, elements: &[LiveSetElement]);

    /// Commit the queued batch
    async fn flush(&mut self) -> Result<()>;
}
