//! SFTP backend (libssh2)
//!
//! Authenticates by private key when one is configured, falling back to
//! password auth. Uploads go to `<name>.part` and are renamed once complete.
//! libssh2 is blocking, so every operation runs on the blocking pool with a
//! fresh session; `backup_id` is the full remote path.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use ssh2::{Session, Sftp};

use super::StorageAdapter;
use crate::error::{Error, Result};
use crate::models::{ArtifactInfo, Secrets, SftpConfig, StoredArtifact};
use crate::pipeline::filename;

const IO_CHUNK: usize = 128 * 1024;

#[derive(Debug)]
pub struct SftpBackend {
    cfg: SftpConfig,
    secrets: Secrets,
}

impl SftpBackend {
    pub fn new(cfg: SftpConfig, secrets: Secrets) -> Result<Self> {
        if secrets.private_key.is_none() && secrets.password.is_none() {
            return Err(Error::Validation(
                "sftp destination needs a private_key or password secret".into(),
            ));
        }
        Ok(Self { cfg, secrets })
    }

    fn remote_base(&self) -> PathBuf {
        PathBuf::from(&self.cfg.root_path)
    }

    /// Establish and authenticate a session. Network failures are transient,
    /// auth failures permanent.
    fn connect(cfg: &SftpConfig, secrets: &Secrets) -> Result<Session> {
        let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .map_err(|e| Error::Transient(format!("sftp connect {}:{}: {}", cfg.host, cfg.port, e)))?;
        let mut session =
            Session::new().map_err(|e| Error::Internal(format!("ssh session init: {}", e)))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| Error::Transient(format!("ssh handshake: {}", e)))?;

        if let Some(private_key) = &secrets.private_key {
            session
                .userauth_pubkey_memory(
                    &cfg.user,
                    None,
                    private_key,
                    secrets.passphrase.as_deref(),
                )
                .map_err(|e| Error::Permanent(format!("sftp key auth failed: {}", e)))?;
        } else if let Some(password) = &secrets.password {
            session
                .userauth_password(&cfg.user, password)
                .map_err(|e| Error::Permanent(format!("sftp password auth failed: {}", e)))?;
        }
        if !session.authenticated() {
            return Err(Error::Permanent("sftp authentication failed".into()));
        }
        Ok(session)
    }

    /// Create every missing directory on the way to `dir`.
    fn mkdir_all(sftp: &Sftp, dir: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        for component in dir.components() {
            current.push(component);
            if current.as_os_str().is_empty() || current == Path::new("/") {
                continue;
            }
            if sftp.stat(&current).is_err() {
                sftp.mkdir(&current, 0o755)
                    .map_err(|e| Error::Transient(format!("sftp mkdir {}: {}", current.display(), e)))?;
            }
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SftpConfig, Secrets) -> Result<T> + Send + 'static,
    {
        let cfg = self.cfg.clone();
        let secrets = self.secrets.clone();
        tokio::task::spawn_blocking(move || op(cfg, secrets))
            .await
            .map_err(|e| Error::Internal(format!("sftp task panicked: {}", e)))?
    }
}

fn list_dir(
    sftp: &Sftp,
    dir: &Path,
    out: &mut Vec<ArtifactInfo>,
) -> Result<()> {
    let entries = match sftp.readdir(dir) {
        Ok(entries) => entries,
        // A target folder that was never written to simply does not exist
        Err(_) => return Ok(()),
    };
    for (path, stat) in entries {
        if stat.is_dir() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let created_at = match filename::parse(&name) {
            Ok(parsed) => parsed.timestamp,
            Err(_) => continue,
        };
        out.push(ArtifactInfo {
            id: path.to_string_lossy().to_string(),
            name,
            size: stat.size.unwrap_or(0),
            created_at,
        });
    }
    Ok(())
}

#[async_trait]
impl StorageAdapter for SftpBackend {
    fn kind(&self) -> &'static str {
        "sftp"
    }

    async fn put(&self, key: &str, source: &Path, _size: u64) -> Result<StoredArtifact> {
        let source = source.to_path_buf();
        let base = self.remote_base();
        let key = key.to_string();

        self.blocking(move |cfg, secrets| {
            let session = SftpBackend::connect(&cfg, &secrets)?;
            let sftp = session
                .sftp()
                .map_err(|e| Error::Transient(format!("sftp subsystem: {}", e)))?;

            let final_path = base.join(&key);
            let parent = final_path
                .parent()
                .ok_or_else(|| Error::Internal("artifact key has no parent".into()))?;
            SftpBackend::mkdir_all(&sftp, parent)?;

            let part_path = PathBuf::from(format!("{}.part", final_path.display()));
            let mut local = std::fs::File::open(&source)?;
            let mut remote = sftp
                .create(&part_path)
                .map_err(|e| Error::Transient(format!("sftp create: {}", e)))?;

            let mut buf = vec![0u8; IO_CHUNK];
            loop {
                let n = local.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                remote
                    .write_all(&buf[..n])
                    .map_err(|e| Error::Transient(format!("sftp write: {}", e)))?;
            }
            drop(remote);

            // Replace any previous upload under the final name
            let _ = sftp.unlink(&final_path);
            sftp.rename(&part_path, &final_path, None)
                .map_err(|e| Error::Transient(format!("sftp rename: {}", e)))?;

            Ok(StoredArtifact {
                backup_id: final_path.to_string_lossy().to_string(),
                created_at: Utc::now(),
            })
        })
        .await
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<ArtifactInfo>> {
        let base = self.remote_base();
        let prefix = prefix.map(str::to_string);

        let mut artifacts = self
            .blocking(move |cfg, secrets| {
                let session = SftpBackend::connect(&cfg, &secrets)?;
                let sftp = session
                    .sftp()
                    .map_err(|e| Error::Transient(format!("sftp subsystem: {}", e)))?;

                let mut out = Vec::new();
                match prefix {
                    Some(folder) => list_dir(&sftp, &base.join(folder), &mut out)?,
                    None => {
                        list_dir(&sftp, &base, &mut out)?;
                        if let Ok(entries) = sftp.readdir(&base) {
                            for (path, stat) in entries {
                                if stat.is_dir() {
                                    list_dir(&sftp, &path, &mut out)?;
                                }
                            }
                        }
                    }
                }
                Ok(out)
            })
            .await?;

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
        if let Some(limit) = limit {
            artifacts.truncate(limit);
        }
        Ok(artifacts)
    }

    async fn get(&self, backup_id: &str, _name: &str, dest: &Path) -> Result<()> {
        let remote_path = PathBuf::from(backup_id);
        let dest = dest.to_path_buf();

        self.blocking(move |cfg, secrets| {
            let session = SftpBackend::connect(&cfg, &secrets)?;
            let sftp = session
                .sftp()
                .map_err(|e| Error::Transient(format!("sftp subsystem: {}", e)))?;

            let mut remote = sftp
                .open(&remote_path)
                .map_err(|e| Error::Permanent(format!("backup not found: {}", e)))?;
            let mut local = std::fs::File::create(&dest)?;

            let mut buf = vec![0u8; IO_CHUNK];
            loop {
                let n = remote
                    .read(&mut buf)
                    .map_err(|e| Error::Transient(format!("sftp read: {}", e)))?;
                if n == 0 {
                    break;
                }
                local.write_all(&buf[..n])?;
            }
            local.flush()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, backup_id: &str, _name: &str) -> Result<()> {
        let remote_path = PathBuf::from(backup_id);
        self.blocking(move |cfg, secrets| {
            let session = SftpBackend::connect(&cfg, &secrets)?;
            let sftp = session
                .sftp()
                .map_err(|e| Error::Transient(format!("sftp subsystem: {}", e)))?;
            sftp.unlink(&remote_path)
                .map_err(|e| Error::Permanent(format!("backup not found: {}", e)))
        })
        .await
    }

    async fn test_connection(&self) -> Result<String> {
        let base = self.remote_base();
        self.blocking(move |cfg, secrets| {
            let session = SftpBackend::connect(&cfg, &secrets)?;
            let sftp = session
                .sftp()
                .map_err(|e| Error::Transient(format!("sftp subsystem: {}", e)))?;
            SftpBackend::mkdir_all(&sftp, &base)?;
            sftp.stat(&base)
                .map_err(|e| Error::Permanent(format!("root path not accessible: {}", e)))?;
            Ok(format!("connected: sftp://{}@{}{}", cfg.user, cfg.host, base.display()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_credentials() {
        let cfg = SftpConfig {
            host: "backups.internal".into(),
            port: 22,
            user: "backup".into(),
            root_path: "/srv/backups".into(),
        };
        let err = SftpBackend::new(cfg.clone(), Secrets::default()).unwrap_err();
        assert_eq!(err.kind().code(), "VALIDATION");

        let ok = SftpBackend::new(
            cfg,
            Secrets {
                password: Some("pw".into()),
                ..Default::default()
            },
        );
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Nothing listens on loopback port 1; connect is refused immediately
        let backend = SftpBackend::new(
            SftpConfig {
                host: "127.0.0.1".into(),
                port: 1,
                user: "backup".into(),
                root_path: "/srv/backups".into(),
            },
            Secrets {
                password: Some("pw".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let err = backend.test_connection().await.unwrap_err();
        assert!(err.is_transient(), "got {:?}", err);
    }

    #[test]
    fn test_created_at_from_filename() {
        // list() derives created_at from the filename grammar
        let parsed = filename::parse("backup_app_20250301_033000.sql.gz").unwrap();
        let expected: chrono::DateTime<Utc> = "2025-03-01T03:30:00Z".parse().unwrap();
        assert_eq!(parsed.timestamp, expected);
    }
}
