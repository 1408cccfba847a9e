use anyhow::Context;
use clap::{Parser, Subcommand};
use fw_core::{Admission, AdmissionDecision, Family, RuleRef, SpecLoader, Table};
use fw_metrics::MetricsCollector;
use fw_nft::{
    KernelState, MemoryConn, NetlinkConn, NftConn, PartialReconcile, ReconcileReport, Reconciler,
    StatusCollector, compile_rule,
};
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fwsync")]
#[command(version, about = "Declarative nftables reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Name unnamed rules and validate a table specification
    Validate {
        file: PathBuf,
        /// Previously admitted version of the same table
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Other specifications in the same scope
        #[arg(long = "sibling")]
        siblings: Vec<PathBuf>,
        /// Directory of specifications forming the scope
        #[arg(long)]
        siblings_dir: Option<PathBuf>,
        /// Write the admitted specification (with generated names) as YAML
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Print the compiled instructions of every rule
    Compile { file: PathBuf },
    /// Run one reconciliation pass against a kernel snapshot
    Plan {
        file: PathBuf,
        /// JSON snapshot of the live kernel state; empty when omitted
        #[arg(long)]
        live: Option<PathBuf>,
        /// Write the resulting snapshot here
        #[arg(long)]
        write: Option<PathBuf>,
        /// Print Prometheus metrics for the pass
        #[arg(long)]
        metrics: bool,
    },
    /// Reconcile the running kernel onto a table specification
    Apply {
        file: PathBuf,
        /// Print Prometheus metrics for the pass
        #[arg(long)]
        metrics: bool,
    },
    /// Capture a live table as a JSON snapshot usable with `plan --live`
    Snapshot {
        #[arg(long, value_parser = parse_family)]
        family: Family,
        #[arg(long)]
        table: String,
        /// Write here instead of printing
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a live table and everything in it
    Delete {
        #[arg(long, value_parser = parse_family)]
        family: Family,
        #[arg(long)]
        table: String,
    },
}

fn parse_family(value: &str) -> Result<Family, String> {
    Family::parse(value).ok_or_else(|| format!("unknown family '{}'", value))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate {
            file,
            previous,
            siblings,
            siblings_dir,
            write,
        } => validate(
            &file,
            previous.as_deref(),
            &siblings,
            siblings_dir.as_deref(),
            write.as_deref(),
        )?,
        Commands::Compile { file } => compile(&file)?,
        Commands::Plan {
            file,
            live,
            write,
            metrics,
        } => {
            tokio::runtime::Runtime::new()?.block_on(async {
                plan(&file, live.as_deref(), write.as_deref(), metrics).await
            })?;
        }
        Commands::Apply { file, metrics } => {
            tokio::runtime::Runtime::new()?.block_on(async { apply(&file, metrics).await })?;
        }
        Commands::Snapshot {
            family,
            table,
            output,
        } => {
            tokio::runtime::Runtime::new()?
                .block_on(async { snapshot(family, &table, output.as_deref()).await })?;
        }
        Commands::Delete { family, table } => {
            tokio::runtime::Runtime::new()?.block_on(async { delete(family, &table).await })?;
        }
    }

    Ok(())
}

/// Run admission; returns the named table or bails with every error listed.
fn admit(table: Table, previous: Option<&Table>, siblings: &[Table]) -> anyhow::Result<Table> {
    let admission = Admission::new(siblings);
    let decision = match previous {
        Some(previous) => admission.review_update(previous, table),
        None => admission.review_create(table),
    };

    match decision {
        AdmissionDecision::Allowed { table, named } => {
            if named > 0 {
                println!("🏷️  Generated names for {} rule(s)", named);
            }
            Ok(table)
        }
        AdmissionDecision::Denied(errors) => {
            println!("\n❌ Specification rejected:\n");
            for error in &errors.0 {
                println!("  • {}", error);
            }
            println!();
            anyhow::bail!("{} validation error(s)", errors.0.len());
        }
    }
}

fn validate(
    file: &Path,
    previous: Option<&Path>,
    siblings: &[PathBuf],
    siblings_dir: Option<&Path>,
    write: Option<&Path>,
) -> anyhow::Result<()> {
    println!("🔍 Validating {}", file.display());
    let loader = SpecLoader::new();
    let table = loader.load_table(file)?;
    let previous = previous.map(|p| loader.load_table(p)).transpose()?;

    let mut scope = siblings
        .iter()
        .map(|p| loader.load_table(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if let Some(dir) = siblings_dir {
        // The directory usually holds the file under review too
        scope.extend(
            loader
                .load_tables_from_dir(dir)?
                .into_iter()
                .filter(|t| *t != table && Some(t) != previous.as_ref()),
        );
    }
    let siblings = scope;

    let table = admit(table, previous.as_ref(), &siblings)?;
    println!(
        "✅ Table '{}' ({}) is valid: {} chain(s), {} set(s)",
        table.name,
        table.family,
        table.chains.len(),
        table.sets.len()
    );

    if let Some(path) = write {
        std::fs::write(path, serde_yaml::to_string(&table)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("💾 Admitted specification written to {}", path.display());
    }

    Ok(())
}

fn compile(file: &Path) -> anyhow::Result<()> {
    let table = admit(SpecLoader::new().load_table(file)?, None, &[])?;
    let ctx = fw_nft::CompileContext::new(table.family);

    println!("📦 Table {} ({})", table.name, table.family);
    for chain in &table.chains {
        println!(
            "\n  ⛓️  {} [{} hook {} priority {}]",
            chain.name, chain.chain_type, chain.hook, chain.priority
        );
        for rule in chain.rules.rules() {
            let name = rule.name().unwrap_or("<unnamed>");
            if let RuleRef::Route(_) = rule {
                println!("    • {} (route rules are not compiled)", name);
                continue;
            }
            let exprs = compile_rule(rule, &ctx)
                .with_context(|| format!("Failed to compile rule '{}' in chain '{}'", name, chain.name))?;
            println!("    • {}", name);
            for expr in &exprs {
                println!("        {}", serde_json::to_string(expr)?);
            }
        }
    }

    Ok(())
}

/// Run one pass and record it. The outer error means the pass aborted; a
/// returned [`PartialReconcile`] means it committed but left rules out.
async fn run_pass<C: NftConn>(
    conn: &mut C,
    table: &Table,
    collector: Option<&MetricsCollector>,
) -> anyhow::Result<(ReconcileReport, Option<PartialReconcile>)> {
    let (report, partial) = match Reconciler::new(conn).reconcile(table).await {
        Ok(report) => (report, None),
        Err(err) => match err.downcast::<PartialReconcile>() {
            Ok(partial) => (partial.report.clone(), Some(partial)),
            Err(err) => {
                if let Some(collector) = collector {
                    collector.record_failure(&table.name);
                }
                return Err(err);
            }
        },
    };

    if let Some(collector) = collector {
        collector.record_report(&report);
    }

    if report.is_noop() && partial.is_none() {
        println!("✅ Live state already matches the specification");
    } else {
        println!("\n📋 Committed {} change(s)", report.mutations());
    }
    if report.rules_skipped > 0 {
        println!("⚠️  {} rule(s) skipped", report.rules_skipped);
    }
    if let Some(partial) = &partial {
        println!("\n❌ Rules left out of this pass:");
        for failure in &partial.failures {
            println!("  • {}", failure);
        }
    }

    Ok((report, partial))
}

async fn print_metrics<C: NftConn>(
    collector: &MetricsCollector,
    conn: &mut C,
    table: &Table,
) -> anyhow::Result<()> {
    if let Some(status) = StatusCollector::new()
        .collect_table_status(conn, table.family, &table.name)
        .await?
    {
        collector.update_table_status(&status);
    }
    println!("\n📊 Metrics:\n{}", collector.render_metrics()?);
    Ok(())
}

async fn plan(
    file: &Path,
    live: Option<&Path>,
    write: Option<&Path>,
    metrics: bool,
) -> anyhow::Result<()> {
    println!("🚀 Planning {}", file.display());
    let table = admit(SpecLoader::new().load_table(file)?, None, &[])?;

    let state = match live {
        Some(path) => KernelState::load(path)?,
        None => KernelState::default(),
    };
    let before = state.to_json_pretty()?;
    let mut conn = MemoryConn::from_state(state);

    let collector = if metrics {
        Some(MetricsCollector::new()?)
    } else {
        None
    };

    let (_, partial) = run_pass(&mut conn, &table, collector.as_ref()).await?;
    for change in conn.journal() {
        println!("  {}", change);
    }

    let after = conn.state().to_json_pretty()?;
    if before != after {
        println!("\n📝 Snapshot diff:\n{}", render_diff(&before, &after));
    }

    if let Some(collector) = &collector {
        print_metrics(collector, &mut conn, &table).await?;
    }

    if let Some(path) = write {
        conn.state().save(path)?;
        println!("💾 Snapshot written to {}", path.display());
    }

    debug!(flushes = conn.flushes(), "plan finished");
    partial.map_or(Ok(()), |partial| Err(partial.into()))
}

async fn apply(file: &Path, metrics: bool) -> anyhow::Result<()> {
    println!("🚀 Applying {}", file.display());
    let table = admit(SpecLoader::new().load_table(file)?, None, &[])?;
    let mut conn = NetlinkConn::connect()?;

    let collector = if metrics {
        Some(MetricsCollector::new()?)
    } else {
        None
    };

    let (report, partial) = run_pass(&mut conn, &table, collector.as_ref()).await?;
    debug!(?report, "apply finished");

    if let Some(collector) = &collector {
        print_metrics(collector, &mut conn, &table).await?;
    }

    partial.map_or(Ok(()), |partial| Err(partial.into()))
}

async fn snapshot(family: Family, table: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let mut conn = NetlinkConn::connect()?;
    let state = KernelState::capture(&mut conn, family, table).await?;
    if state.tables.is_empty() {
        println!("ℹ️  Table '{}' ({}) does not exist", table, family);
    }

    match output {
        Some(path) => {
            state.save(path)?;
            println!("💾 Snapshot of '{}' written to {}", table, path.display());
        }
        None => println!("{}", state.to_json_pretty()?),
    }
    Ok(())
}

async fn delete(family: Family, table: &str) -> anyhow::Result<()> {
    let mut conn = NetlinkConn::connect()?;
    if Reconciler::new(&mut conn).delete_table(family, table).await? {
        println!("🗑️  Table '{}' ({}) deleted", table, family);
    } else {
        println!("ℹ️  Table '{}' ({}) does not exist", table, family);
    }
    Ok(())
}

fn render_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_diff_marks_changed_lines() {
        let diff = render_diff("a\nb\n", "a\nc\n");
        assert_eq!(diff, " a\n-b\n+c\n");
    }

    #[test]
    fn cli_parses_plan_flags() {
        let cli = Cli::parse_from([
            "fwsync", "plan", "edge.yaml", "--live", "live.json", "--metrics",
        ]);
        match cli.command {
            Commands::Plan {
                file, live, metrics, ..
            } => {
                assert_eq!(file, PathBuf::from("edge.yaml"));
                assert_eq!(live, Some(PathBuf::from("live.json")));
                assert!(metrics);
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn cli_parses_kernel_commands() {
        let cli = Cli::parse_from(["fwsync", "snapshot", "--family", "ip6", "--table", "edge6"]);
        match cli.command {
            Commands::Snapshot {
                family,
                table,
                output,
            } => {
                assert_eq!(family, Family::Ipv6);
                assert_eq!(table, "edge6");
                assert_eq!(output, None);
            }
            _ => panic!("expected snapshot"),
        }

        let cli = Cli::parse_from(["fwsync", "apply", "edge.yaml", "--metrics"]);
        assert!(matches!(cli.command, Commands::Apply { metrics: true, .. }));

        assert!(Cli::try_parse_from(["fwsync", "delete", "--family", "ipx", "--table", "t"]).is_err());
    }
}
