use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::error::{Error, Result};
use super::retry::{retry_on_block, RetryPolicy};
use super::session::SshSession;
use super::transport::Transport;

/// Default receive window for new channels (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;
/// Default maximum packet size for new channels.
pub const DEFAULT_PACKET_SIZE: u32 = 32 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Output of a remote command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
}

/// A "session" channel on an SSH session.
pub struct Channel<'s, T: Transport> {
    session: &'s SshSession<T>,
    native: Option<T::Channel>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<'s, T: Transport> Channel<'s, T> {
    pub async fn open(
        session: &'s SshSession<T>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let transport = session.transport();
        let ssh = session.native()?;
        transport.set_blocking(ssh, true);

        let native = retry_on_block!(
            &policy,
            &cancel,
            transport.channel_open_session(ssh, DEFAULT_WINDOW_SIZE, DEFAULT_PACKET_SIZE)
        )
        .map_err(|e| e.into_error("open channel", &policy, |t| Error::ChannelOpen(t.to_string())))?
        .ok_or_else(|| Error::ChannelOpen("transport returned no channel handle".to_string()))?;

        Ok(Self {
            session,
            native: Some(native),
            policy,
            cancel,
        })
    }

    pub async fn exec(&mut self, command: &str) -> Result<()> {
        let transport = self.session.transport();
        let native = self.native.as_mut().ok_or(Error::MissingSession)?;
        retry_on_block!(&self.policy, &self.cancel, transport.channel_exec(native, command))
            .map_err(|e| e.into_error("exec", &self.policy, |t| Error::Exec(t.to_string())))
    }

    /// Read stdout until the remote side closes the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let transport = self.session.transport();
        let native = self.native.as_mut().ok_or(Error::MissingSession)?;

        let mut output = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = retry_on_block!(&self.policy, &self.cancel, transport.channel_read(native, &mut chunk))
                .map_err(|e| e.into_error("read channel", &self.policy, |t| Error::Exec(t.to_string())))?;
            if n == 0 {
                return Ok(output);
            }
            output.extend_from_slice(&chunk[..n.min(chunk.len())]);
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.native
            .as_ref()
            .map(|native| self.session.transport().channel_exit_status(native))
    }

    /// Request close, wait for the peer's acknowledgment when the request
    /// went out, then free the channel no matter how the first two went.
    pub async fn close(mut self) {
        let Some(mut native) = self.native.take() else {
            return;
        };
        let transport = self.session.transport();
        let closed = retry_on_block!(&self.policy, &self.cancel, transport.channel_close(&mut native));
        match closed {
            Ok(()) => {
                if let Err(e) =
                    retry_on_block!(&self.policy, &self.cancel, transport.channel_wait_closed(&mut native))
                {
                    log::warn!("Waiting for channel close failed: {}", e);
                }
            }
            Err(e) => log::warn!("Channel close request failed: {}", e),
        }
        transport.channel_free(native);
    }
}

impl<T: Transport> Drop for Channel<'_, T> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            log::debug!("Releasing unclosed channel");
            self.session.transport().channel_free(native);
        }
    }
}
