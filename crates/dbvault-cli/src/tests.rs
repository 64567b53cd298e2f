//! CLI parsing and exit-code tests

use clap::Parser;

use crate::cli::{Cli, Commands, SchedulesAction};
use crate::commands::api::{ApiError, EXIT_AUTH, EXIT_UPSTREAM, EXIT_USAGE};

#[test]
fn test_parse_serve() {
    let cli = Cli::parse_from(["dbvault", "serve", "--port", "9090", "--no-auth"]);
    match cli.command {
        Commands::Serve { port, no_auth, .. } => {
            assert_eq!(port, 9090);
            assert!(no_auth);
        }
        _ => panic!("expected serve"),
    }
}

#[test]
fn test_parse_backup_now_destinations() {
    let cli = Cli::parse_from([
        "dbvault",
        "backup-now",
        "--target",
        "t1",
        "--destination",
        "d1",
        "--destination",
        "d2",
    ]);
    match cli.command {
        Commands::BackupNow {
            target,
            destinations,
            local,
        } => {
            assert_eq!(target, "t1");
            assert_eq!(destinations, vec!["d1", "d2"]);
            assert!(!local);
        }
        _ => panic!("expected backup-now"),
    }
}

#[test]
fn test_parse_restore_now_requires_confirm() {
    let result = Cli::try_parse_from([
        "dbvault",
        "restore-now",
        "--target",
        "t1",
        "--backup-id",
        "b1",
    ]);
    assert!(result.is_err(), "--confirm is mandatory");
}

#[test]
fn test_parse_schedules_run_now() {
    let cli = Cli::parse_from(["dbvault", "schedules", "run-now", "s1"]);
    match cli.command {
        Commands::Schedules {
            action: Some(SchedulesAction::RunNow { id }),
        } => assert_eq!(id, "s1"),
        _ => panic!("expected schedules run-now"),
    }
}

#[test]
fn test_api_error_exit_codes() {
    assert_eq!(ApiError::Unreachable("refused".into()).exit_code(), EXIT_UPSTREAM);
    assert_eq!(ApiError::Auth("expired".into()).exit_code(), EXIT_AUTH);
    assert_eq!(
        ApiError::Api {
            status: 400,
            message: "bad".into()
        }
        .exit_code(),
        EXIT_USAGE
    );
    assert_eq!(
        ApiError::Api {
            status: 500,
            message: "boom".into()
        }
        .exit_code(),
        1
    );
}
