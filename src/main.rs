//! # dbcluster demo
//!
//! Runs SQL through a cluster of in-memory replicas and reports what each
//! replica ended up with.
//!
//! ```bash
//! # Two default replicas, one write and one read
//! dbcluster "INSERT INTO t VALUES (1)" "SELECT * FROM t"
//!
//! # Cluster from a config file, with replica db2 failing
//! dbcluster --config cluster.json --fail db2 "INSERT INTO t VALUES (1)"
//!
//! # Everything in one transaction
//! dbcluster --transaction "INSERT INTO t VALUES (nextval('s'))" "UPDATE t SET x = 1"
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use dbcluster::backend::memory::MemoryDatabase;
use dbcluster::{Cluster, ClusterConfig, ClusterConnection, ClusterDataSource, ReplicaConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "dbcluster", version, about = "Run SQL through a replicated in-memory cluster")]
struct Cli {
    /// Cluster configuration (JSON). Defaults to two replicas, db1 local.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Take a replica down before running the statements
    #[arg(short, long, value_name = "REPLICA")]
    fail: Vec<String>,

    /// Run all statements in one transaction
    #[arg(short, long)]
    transaction: bool,

    /// Statements to execute, in order
    #[arg(required = true)]
    sql: Vec<String>,
}

fn default_config() -> ClusterConfig {
    ClusterConfig::new("demo")
        .replica(ReplicaConfig::new("db1").local())
        .replica(ReplicaConfig::new("db2"))
}

async fn run_statement(connection: &ClusterConnection, sql: &str) -> Result<()> {
    let statement = connection.create_statement().await?;
    let traits = statement.node().cluster().sql().classify(sql);

    if traits.select {
        let rows = statement.execute_query(sql).await?;
        let mut count = 0;
        while rows.next().await? {
            count += 1;
            println!("  {} | {}", rows.get(0).await?, rows.get(1).await?);
        }
        println!("{} row(s)", count);
    } else {
        let affected = statement.execute_update(sql).await?;
        println!("{} row(s) affected", affected);
    }

    statement.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ClusterConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => default_config(),
    };

    let databases: BTreeMap<String, Arc<MemoryDatabase>> = config
        .replicas
        .iter()
        .enumerate()
        .map(|(index, replica)| {
            let offset = index as i64 * 1_000;
            (replica.id.clone(), MemoryDatabase::with_key_offset(&replica.id, offset))
        })
        .collect();

    for replica in &cli.fail {
        let Some(database) = databases.get(replica) else {
            bail!("--fail names unknown replica '{}'", replica);
        };
        database.set_down(true);
    }

    let cluster = Cluster::new(config)?;
    let source = ClusterDataSource::new(
        cluster.clone(),
        databases
            .iter()
            .map(|(id, database)| (id.clone(), database.data_source())),
    )?;

    let connection = source.connect().await?;
    if cli.transaction {
        connection.set_auto_commit(false).await?;
    }

    for sql in &cli.sql {
        println!("> {}", sql);
        if let Err(error) = run_statement(&connection, sql).await {
            println!("error: {}", error);
        }
    }

    if cli.transaction {
        connection.commit().await?;
    }
    connection.close().await;

    println!();
    println!("cluster '{}':", cluster.id());
    for status in cluster.status() {
        let committed = databases
            .get(&status.id)
            .map(|database| database.committed().len())
            .unwrap_or_default();
        println!("  {} committed={}", status, committed);
    }

    Ok(())
}
