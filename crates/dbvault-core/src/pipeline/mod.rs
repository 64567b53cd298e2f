//! Backup and restore pipelines
//!
//! `backup` dumps once into a spool file, applies the gzip (+ optional
//! encryption envelope) transforms, fans the artifact out to every
//! destination, applies retention, finalizes the run, and notifies.
//! `restore` reverses the transforms under the confirmation gate.

pub mod backup;
pub mod filename;
pub mod restore;

pub use backup::BackupRequest;
pub use restore::RestoreRequest;
