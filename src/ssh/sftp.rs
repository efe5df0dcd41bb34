use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::entry::{FileKind, RemoteFileEntry};
use super::error::{Error, Result};
use super::handle::SftpHandle;
use super::permission::FilePermission;
use super::retry::{retry_on_block, RetryError, RetryPolicy};
use super::session::SshSession;
use super::transport::{FileAttributes, LinkMode, OpenFlags, OpenKind, Transport, TransportError};

/// First buffer size tried for link resolution; doubled on "too small".
pub const INITIAL_LINK_BUFFER: usize = 256;
/// Link targets longer than this are rejected instead of growing further.
pub const MAX_LINK_BUFFER: usize = 64 * 1024;

/// SFTP subsystem bound to one SSH session.
///
/// Keeps its [`SshSession`] alive; the subsystem is shut down before the
/// session can be freed.
pub struct SftpSession<T: Transport> {
    native: Option<T::Sftp>,
    session: Arc<SshSession<T>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<T: Transport> SftpSession<T> {
    /// Start the SFTP subsystem on an authenticated session.
    pub async fn open(
        session: Arc<SshSession<T>>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let native = {
            let transport = session.transport();
            let ssh = session.native()?;
            retry_on_block!(&policy, &cancel, transport.sftp_init(ssh)).map_err(|e| {
                e.into_error("start SFTP session", &policy, |t| Error::SftpSession(t.to_string()))
            })?
        };
        log::info!("SFTP session started");
        Ok(Self {
            native: Some(native),
            session,
            policy,
            cancel,
        })
    }

    pub fn transport(&self) -> &Arc<T> {
        self.session.transport()
    }

    pub fn session(&self) -> &Arc<SshSession<T>> {
        &self.session
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn native(&self) -> Result<&T::Sftp> {
        self.native.as_ref().ok_or(Error::MissingSession)
    }

    /// Create one directory. The parent must exist.
    pub async fn mkdir(&self, path: &str, permission: FilePermission) -> Result<()> {
        let sftp = self.native()?;
        let mode = permission.mode();
        log::debug!("mkdir {} ({})", path, permission);
        retry_on_block!(&self.policy, &self.cancel, self.transport().sftp_mkdir(sftp, path, mode))
            .map_err(|e| {
                e.into_error("create directory", &self.policy, |t| Error::CreateDirectory {
                    path: path.to_string(),
                    reason: t.to_string(),
                })
            })
    }

    /// Create `path` and any missing parents, root to leaf.
    ///
    /// A component whose mkdir fails is accepted when it already exists as a
    /// directory.
    pub async fn create_dir_all(&self, path: &str, permission: FilePermission) -> Result<()> {
        if path.trim().is_empty() {
            return Err(Error::CreateDirectory {
                path: path.to_string(),
                reason: "empty path".to_string(),
            });
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
        if components.is_empty() {
            // Nothing to create: "/" or "." must already be a directory.
            let attrs = self.stat(path).await.map_err(|e| Error::CreateDirectory {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            if !FileKind::from_attributes(&attrs).is_dir() {
                return Err(Error::CreateDirectory {
                    path: path.to_string(),
                    reason: "not a directory".to_string(),
                });
            }
            return Ok(());
        }

        let mut current = String::new();
        for component in components {
            if (!current.is_empty() || path.starts_with('/')) && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(component);

            match self.mkdir(&current, permission).await {
                Ok(()) => {}
                Err(Error::CreateDirectory { path: failed, reason }) => match self.stat(&current).await {
                    Ok(attrs) if FileKind::from_attributes(&attrs).is_dir() => {
                        log::debug!("{} already exists", current);
                    }
                    _ => return Err(Error::CreateDirectory { path: failed, reason }),
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let sftp = self.native()?;
        retry_on_block!(&self.policy, &self.cancel, self.transport().sftp_rmdir(sftp, path)).map_err(
            |e| {
                e.into_error("remove directory", &self.policy, |t| Error::RemoveDirectory {
                    path: path.to_string(),
                    reason: t.to_string(),
                })
            },
        )
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        let sftp = self.native()?;
        retry_on_block!(&self.policy, &self.cancel, self.transport().sftp_unlink(sftp, path)).map_err(
            |e| {
                e.into_error("remove file", &self.policy, |t| Error::RemoveFile {
                    path: path.to_string(),
                    reason: t.to_string(),
                })
            },
        )
    }

    pub async fn stat(&self, path: &str) -> Result<FileAttributes> {
        let sftp = self.native()?;
        retry_on_block!(&self.policy, &self.cancel, self.transport().sftp_stat(sftp, path)).map_err(
            |e| {
                e.into_error("stat", &self.policy, |t| Error::Stat {
                    path: path.to_string(),
                    reason: t.to_string(),
                })
            },
        )
    }

    /// Replace the permission bits of `path`.
    pub async fn set_permissions(&self, path: &str, permission: FilePermission) -> Result<()> {
        let sftp = self.native()?;
        let attrs = FileAttributes {
            permissions: Some(permission.mode()),
            ..Default::default()
        };
        retry_on_block!(
            &self.policy,
            &self.cancel,
            self.transport().sftp_setstat(sftp, path, &attrs)
        )
        .map_err(|e| {
            e.into_error("set permissions", &self.policy, |t| Error::SetPermissions {
                path: path.to_string(),
                reason: t.to_string(),
            })
        })
    }

    pub async fn open_dir(&self, path: &str) -> Result<SftpHandle<'_, T>> {
        let sftp = self.native()?;
        let native = retry_on_block!(
            &self.policy,
            &self.cancel,
            self.transport()
                .sftp_open(sftp, path, OpenFlags::READ, 0, OpenKind::Directory)
        )
        .map_err(|e| {
            e.into_error("open directory", &self.policy, |t| Error::OpenDirectory {
                path: path.to_string(),
                reason: t.to_string(),
            })
        })?;
        Ok(SftpHandle::new(self, native, OpenKind::Directory, path))
    }

    pub async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        permission: FilePermission,
    ) -> Result<SftpHandle<'_, T>> {
        let sftp = self.native()?;
        let mode = permission.mode();
        let native = retry_on_block!(
            &self.policy,
            &self.cancel,
            self.transport().sftp_open(sftp, path, flags, mode, OpenKind::File)
        )
        .map_err(|e| {
            e.into_error("open file", &self.policy, |t| Error::OpenFile {
                path: path.to_string(),
                reason: t.to_string(),
            })
        })?;
        Ok(SftpHandle::new(self, native, OpenKind::File, path))
    }

    /// List a directory in read order, without `.` and `..`.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<RemoteFileEntry>> {
        let mut handle = self.open_dir(path).await?;
        let mut entries = Vec::new();
        let listed = loop {
            match handle.next_entry().await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        handle.close().await;
        listed?;
        log::debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    /// Download a whole file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut handle = self.open_file(path, OpenFlags::READ, FilePermission::FILE).await?;
        let data = handle.read_to_end().await;
        handle.close().await;
        data
    }

    /// Create or truncate `path` and write `data` to it.
    pub async fn write_file(&self, path: &str, data: &[u8], permission: FilePermission) -> Result<()> {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mut handle = self.open_file(path, flags, permission).await?;
        let written = handle.write_all(data).await;
        handle.close().await;
        written
    }

    /// Resolve a link. `complex` selects the canonical real path instead of
    /// the raw link target.
    pub async fn resolve_symlink(&self, path: &str, complex: bool) -> Result<String> {
        let sftp = self.native()?;
        let mode = LinkMode::from_complex(complex);
        let resolve_error = |reason: String| Error::ResolveSymlink {
            path: path.to_string(),
            reason,
        };

        let mut capacity = INITIAL_LINK_BUFFER;
        loop {
            let mut target = vec![0u8; capacity];
            let outcome = retry_on_block!(
                &self.policy,
                &self.cancel,
                self.transport().sftp_symlink(sftp, path, &mut target, mode)
            );
            match outcome {
                Ok(len) => {
                    let len = len.min(target.len());
                    return Ok(String::from_utf8_lossy(&target[..len]).into_owned());
                }
                Err(RetryError::Transport(TransportError::BufferTooSmall)) => {
                    if capacity >= MAX_LINK_BUFFER {
                        return Err(resolve_error(format!(
                            "target longer than {} bytes",
                            MAX_LINK_BUFFER
                        )));
                    }
                    capacity *= 2;
                    log::trace!("Link buffer too small, growing to {}", capacity);
                }
                Err(e) => {
                    return Err(e.into_error("resolve link", &self.policy, |t| {
                        resolve_error(t.to_string())
                    }))
                }
            }
        }
    }
}

impl<T: Transport> Drop for SftpSession<T> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            log::debug!("Shutting down SFTP session");
            self.session.transport().sftp_shutdown(native);
        }
    }
}
