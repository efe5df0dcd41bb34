use super::entry::RemoteFileEntry;
use super::error::{Error, Result};
use super::retry::retry_on_block;
use super::sftp::SftpSession;
use super::transport::{OpenKind, Transport};

/// Capacity of the per-record name and long-entry buffers.
pub const ENTRY_BUFFER_LEN: usize = 512;

const READ_CHUNK: usize = 32 * 1024;

/// An open remote directory stream or file.
///
/// Borrows its [`SftpSession`], so every handle is gone before the session
/// can shut down. [`SftpHandle::close`] performs the graceful close; dropping
/// an unclosed handle still frees the native handle.
pub struct SftpHandle<'s, T: Transport> {
    sftp: &'s SftpSession<T>,
    native: Option<T::Handle>,
    kind: OpenKind,
    path: String,
}

impl<'s, T: Transport> SftpHandle<'s, T> {
    pub(crate) fn new(sftp: &'s SftpSession<T>, native: T::Handle, kind: OpenKind, path: &str) -> Self {
        Self {
            sftp,
            native: Some(native),
            kind,
            path: path.to_string(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == OpenKind::Directory
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next entry of a directory stream, skipping `.` and `..`.
    /// `Ok(None)` is end of stream.
    pub async fn next_entry(&mut self) -> Result<Option<RemoteFileEntry>> {
        if !self.is_directory() {
            return Err(Error::ReadDirectory {
                path: self.path.clone(),
                reason: "not a directory handle".to_string(),
            });
        }
        let sftp = self.sftp;
        let transport = sftp.transport();
        let policy = sftp.policy();
        loop {
            if sftp.cancel_token().is_cancelled() {
                return Err(Error::Cancelled("read directory"));
            }
            let native = self.native.as_mut().ok_or(Error::MissingSession)?;

            // Scratch buffers live for one record only.
            let mut name = [0u8; ENTRY_BUFFER_LEN];
            let mut long_entry = [0u8; ENTRY_BUFFER_LEN];
            let record = retry_on_block!(
                policy,
                sftp.cancel_token(),
                transport.sftp_readdir(native, &mut name, &mut long_entry)
            )
            .map_err(|e| {
                e.into_error("read directory", policy, |t| Error::ReadDirectory {
                    path: self.path.clone(),
                    reason: t.to_string(),
                })
            })?;

            let Some(record) = record else {
                return Ok(None);
            };
            let name_len = record.name_len.min(name.len());
            let long_len = record.longentry_len.min(long_entry.len());
            if let Some(entry) =
                RemoteFileEntry::parse(&name[..name_len], &record.attrs, Some(&long_entry[..long_len]))
            {
                return Ok(Some(entry));
            }
        }
    }

    /// Read up to `buf.len()` bytes from a file handle. `Ok(0)` is end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let path = self.path.clone();
        let read_error = |reason: String| Error::ReadFile { path: path.clone(), reason };
        if self.is_directory() {
            return Err(read_error("handle is a directory".to_string()));
        }
        let sftp = self.sftp;
        let transport = sftp.transport();
        let policy = sftp.policy();
        let native = self.native.as_mut().ok_or(Error::MissingSession)?;
        retry_on_block!(policy, sftp.cancel_token(), transport.sftp_read(native, buf))
            .map_err(|e| e.into_error("read file", policy, |t| read_error(t.to_string())))
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n.min(chunk.len())]);
        }
    }

    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        let path = self.path.clone();
        let write_error = |reason: String| Error::WriteFile { path: path.clone(), reason };
        if self.is_directory() {
            return Err(write_error("handle is a directory".to_string()));
        }
        let sftp = self.sftp;
        let transport = sftp.transport();
        let policy = sftp.policy();
        while !data.is_empty() {
            let native = self.native.as_mut().ok_or(Error::MissingSession)?;
            let written =
                retry_on_block!(policy, sftp.cancel_token(), transport.sftp_write(native, data))
                    .map_err(|e| e.into_error("write file", policy, |t| write_error(t.to_string())))?;
            if written == 0 {
                return Err(write_error("transport accepted no bytes".to_string()));
            }
            data = &data[written.min(data.len())..];
        }
        Ok(())
    }

    /// Ask the server to close the handle, then free it whatever the answer.
    pub async fn close(mut self) {
        let Some(mut native) = self.native.take() else {
            return;
        };
        let sftp = self.sftp;
        let transport = sftp.transport();
        let policy = sftp.policy();
        if let Err(e) = retry_on_block!(policy, sftp.cancel_token(), transport.sftp_close(&mut native)) {
            log::warn!("Closing {} failed, releasing anyway: {}", self.path, e);
        }
        transport.sftp_handle_free(native);
    }
}

impl<T: Transport> Drop for SftpHandle<'_, T> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            log::debug!("Releasing unclosed handle for {}", self.path);
            self.sftp.transport().sftp_handle_free(native);
        }
    }
}
