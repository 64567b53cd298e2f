//! Command implementations

pub mod api;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

use dbvault_core::engine::{Engine, EngineConfig};
use dbvault_core::{Notifier, Store};
use dbvault_server::ServerConfig;

use api::{ApiClient, EXIT_PARTIAL};

/// Start the API server and scheduler in-process.
pub async fn cmd_serve(
    host: &str,
    port: u16,
    db: &Path,
    local_root: Option<PathBuf>,
    workers: Option<usize>,
    no_auth: bool,
) -> Result<u8> {
    let store = Store::open(db.to_str().context("repository path is not UTF-8")?)
        .context("failed to open the repository store")?;

    let mut engine_config = EngineConfig::from_env();
    if let Some(root) = local_root {
        engine_config.local_root = root;
    }
    if let Some(workers) = workers {
        engine_config.workers = workers.max(1);
    }
    info!(
        "Local storage root: {}, {} workers",
        engine_config.local_root.display(),
        engine_config.workers
    );

    let engine = Engine::new(store, engine_config, Notifier::from_env());

    let mut server_config = ServerConfig::from_env();
    if no_auth {
        server_config.require_auth = false;
    } else if server_config.tokens.is_empty() {
        anyhow::bail!(
            "no API tokens configured; set DBVAULT_API_TOKENS or pass --no-auth for local development"
        );
    }

    dbvault_server::serve(engine, host, port, server_config)
        .await
        .context("server error")?;

    Ok(0)
}

fn print_or_exit(result: Result<Value, api::ApiError>) -> Result<(Value, u8)> {
    match result {
        Ok(value) => Ok((value, 0)),
        Err(e) => {
            eprintln!("error: {}", e);
            Ok((Value::Null, e.exit_code()))
        }
    }
}

pub async fn cmd_targets_list(client: &ApiClient) -> Result<u8> {
    let (targets, code) = print_or_exit(client.get("/automation/targets").await)?;
    if let Some(targets) = targets.as_array() {
        if targets.is_empty() {
            println!("No targets registered.");
        }
        for t in targets {
            println!(
                "{}  {:20}  {:10}  {}",
                t["id"].as_str().unwrap_or("-"),
                t["name"].as_str().unwrap_or("-"),
                t["db_type"].as_str().unwrap_or("-"),
                if t["is_active"].as_bool().unwrap_or(false) {
                    "active"
                } else {
                    "inactive"
                },
            );
        }
    }
    Ok(code)
}

pub async fn cmd_destinations_list(client: &ApiClient) -> Result<u8> {
    let (destinations, code) = print_or_exit(client.get("/automation/destinations").await)?;
    if let Some(destinations) = destinations.as_array() {
        if destinations.is_empty() {
            println!("No managed destinations (the built-in __local__ storage is always available).");
        }
        for d in destinations {
            println!(
                "{}  {:20}  {:12}  {}",
                d["id"].as_str().unwrap_or("-"),
                d["name"].as_str().unwrap_or("-"),
                d["destination_type"].as_str().unwrap_or("-"),
                if d["is_active"].as_bool().unwrap_or(false) {
                    "active"
                } else {
                    "inactive"
                },
            );
        }
    }
    Ok(code)
}

pub async fn cmd_destination_backups(
    client: &ApiClient,
    id: &str,
    target: Option<&str>,
) -> Result<u8> {
    let mut path = format!("/automation/destinations/{}/backups?include_total=true", id);
    if let Some(target) = target {
        path.push_str(&format!("&target_id={}", target));
    }
    let (listing, code) = print_or_exit(client.get(&path).await)?;
    if let Some(items) = listing["items"].as_array() {
        for item in items {
            println!(
                "{:48}  {:>12}  {}  {}",
                item["name"].as_str().unwrap_or("-"),
                item["size"].as_u64().unwrap_or(0),
                item["created_at"].as_str().unwrap_or("-"),
                item["id"].as_str().unwrap_or("-"),
            );
        }
        if let Some(total) = listing["total"].as_u64() {
            println!("{} backup(s)", total);
        }
    }
    Ok(code)
}

pub async fn cmd_schedules_list(client: &ApiClient) -> Result<u8> {
    let (schedules, code) = print_or_exit(client.get("/automation/schedules").await)?;
    if let Some(schedules) = schedules.as_array() {
        if schedules.is_empty() {
            println!("No schedules.");
        }
        for s in schedules {
            println!(
                "{}  {:20}  every {:>6}s  {:8}  next {}",
                s["id"].as_str().unwrap_or("-"),
                s["name"].as_str().unwrap_or("-"),
                s["interval_seconds"].as_i64().unwrap_or(0),
                if s["enabled"].as_bool().unwrap_or(false) {
                    "enabled"
                } else {
                    "disabled"
                },
                s["next_run_at"].as_str().unwrap_or("-"),
            );
        }
    }
    Ok(code)
}

pub async fn cmd_schedule_run_now(client: &ApiClient, id: &str) -> Result<u8> {
    let (queued, code) = print_or_exit(
        client
            .post(&format!("/automation/schedules/{}/run-now", id), json!({}))
            .await,
    )?;
    if code == 0 {
        println!(
            "Queued run of schedule '{}'",
            queued["schedule_name"].as_str().unwrap_or(id)
        );
    }
    Ok(code)
}

pub async fn cmd_run_enabled_now(client: &ApiClient, max: usize) -> Result<u8> {
    let (response, code) = print_or_exit(
        client
            .post(
                "/automation/schedules/run-enabled-now",
                json!({"max_schedules": max}),
            )
            .await,
    )?;
    if let Some(queued) = response["queued"].as_array() {
        println!("Queued {} schedule(s)", queued.len());
        for q in queued {
            println!("- {}", q["schedule_name"].as_str().unwrap_or("-"));
        }
    }
    Ok(code)
}

fn print_run_summary(run: &Value) {
    println!(
        "run {}: {} ({})",
        run["id"].as_str().unwrap_or("-"),
        run["status"].as_str().unwrap_or("-"),
        run["backup_filename"].as_str().unwrap_or("no artifact"),
    );
    if let Some(destinations) = run["detail"]["destinations"].as_array() {
        for d in destinations {
            let status = d["status"].as_str().unwrap_or("-");
            match d["error"].as_str() {
                Some(err) => println!(
                    "- {}: {} ({})",
                    d["destination_name"].as_str().unwrap_or("-"),
                    status,
                    err
                ),
                None => println!(
                    "- {}: {}",
                    d["destination_name"].as_str().unwrap_or("-"),
                    status
                ),
            }
        }
    }
    if let Some(error) = run["error_message"].as_str() {
        println!("error: {}", error);
    }
}

/// Exit code for a terminal run: partial success gets its own code so
/// scripts can tell "some copies missing" from a clean pass.
fn run_exit_code(run: &Value) -> u8 {
    match run["status"].as_str() {
        Some("success") => 0,
        Some("partial_success") => EXIT_PARTIAL,
        _ => 1,
    }
}

pub async fn cmd_backup_now(
    client: &ApiClient,
    target: &str,
    destinations: &[String],
    local: bool,
) -> Result<u8> {
    let mut body = json!({
        "target_id": target,
        "use_local_storage": local || destinations.is_empty(),
    });
    if !destinations.is_empty() {
        body["destination_ids"] = json!(destinations);
    }

    let (run, code) = print_or_exit(client.post("/automation/backup-now", body).await)?;
    if code != 0 {
        return Ok(code);
    }
    print_run_summary(&run);
    Ok(run_exit_code(&run))
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_restore_now(
    client: &ApiClient,
    target: &str,
    backup_id: &str,
    destination: Option<&str>,
    local: bool,
    confirm: &str,
    password: Option<&str>,
) -> Result<u8> {
    let mut body = json!({
        "target_id": target,
        "backup_id": backup_id,
        "use_local_storage": local || destination.is_none(),
        "confirmation": confirm,
    });
    if let Some(destination) = destination {
        body["destination_id"] = json!(destination);
    }
    if let Some(password) = password {
        body["encryption_password"] = json!(password);
    }

    let (run, code) = print_or_exit(client.post("/automation/restore-now", body).await)?;
    if code != 0 {
        return Ok(code);
    }
    print_run_summary(&run);
    Ok(run_exit_code(&run))
}

pub async fn cmd_runs(
    client: &ApiClient,
    target: Option<&str>,
    operation: Option<&str>,
    limit: i64,
) -> Result<u8> {
    let mut path = format!("/automation/audit?limit={}", limit);
    if let Some(target) = target {
        path.push_str(&format!("&target_id={}", target));
    }
    if let Some(operation) = operation {
        path.push_str(&format!("&operation={}", operation));
    }

    let (response, code) = print_or_exit(client.get(&path).await)?;
    if let Some(runs) = response["runs"].as_array() {
        if runs.is_empty() {
            println!("No runs recorded.");
        }
        for run in runs {
            println!(
                "{}  {:8}  {:9}  {:16}  {:15}  {}",
                run["started_at"].as_str().unwrap_or("-"),
                run["operation"].as_str().unwrap_or("-"),
                run["trigger"].as_str().unwrap_or("-"),
                run["status"].as_str().unwrap_or("-"),
                run["target_name"].as_str().unwrap_or("-"),
                run["backup_filename"].as_str().unwrap_or(""),
            );
        }
    }
    Ok(code)
}
