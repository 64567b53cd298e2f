//! Neo4j adapter: cypher-shell
//!
//! Dumps export the graph as a Cypher script via APOC
//! (`apoc.export.cypher.all` streamed through `cypher-shell`); restores feed
//! the script back. Auth is optional.

use std::path::Path;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{run_tool_from_file, run_tool_probe, run_tool_to_file, DumpOutput};
use crate::error::Result;
use crate::models::{Neo4jConfig, Secrets};

const EXPORT_QUERY: &str = "CALL apoc.export.cypher.all(null, \
     {format: 'plain', stream: true, streamStatements: true}) \
     YIELD cypherStatements RETURN cypherStatements;";

fn base_cmd(cfg: &Neo4jConfig, secrets: &Secrets) -> Command {
    let mut cmd = Command::new("cypher-shell");
    cmd.arg("-a")
        .arg(format!("bolt://{}:{}", cfg.host, cfg.port))
        .arg("--format")
        .arg("plain");
    if let Some(database) = &cfg.database {
        cmd.arg("-d").arg(database);
    }
    if let Some(user) = &cfg.user {
        // Credentials go through the environment, not the command line
        cmd.env("NEO4J_USERNAME", user);
        if let Some(password) = &secrets.password {
            cmd.env("NEO4J_PASSWORD", password);
        }
    }
    cmd
}

pub async fn dump(
    cfg: &Neo4jConfig,
    secrets: &Secrets,
    sink: &Path,
    cancel: &CancellationToken,
) -> Result<DumpOutput> {
    let mut cmd = base_cmd(cfg, secrets);
    cmd.arg(EXPORT_QUERY);

    let bytes_written = run_tool_to_file("cypher-shell", cmd, sink, cancel).await?;
    Ok(DumpOutput {
        bytes_written,
        logical_format: "cypher",
    })
}

pub async fn restore(
    cfg: &Neo4jConfig,
    secrets: &Secrets,
    source: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let cmd = base_cmd(cfg, secrets);
    run_tool_from_file("cypher-shell", cmd, source, cancel).await
}

pub async fn test_connection(
    cfg: &Neo4jConfig,
    secrets: &Secrets,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut cmd = base_cmd(cfg, secrets);
    cmd.arg("RETURN 1;");
    run_tool_probe("cypher-shell", cmd, cancel).await?;
    Ok(format!("connected: bolt://{}:{}", cfg.host, cfg.port))
}
