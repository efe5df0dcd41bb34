use std::sync::Arc;

use super::error::{Error, Result};
use super::transport::Transport;

/// Owns one native SSH session handle and frees it exactly once.
pub struct SshSession<T: Transport> {
    transport: Arc<T>,
    native: Option<T::Session>,
}

impl<T: Transport> SshSession<T> {
    /// Take ownership of an already initialized native session.
    pub fn new(transport: Arc<T>, native: T::Session) -> Self {
        Self {
            transport,
            native: Some(native),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn native(&self) -> Result<&T::Session> {
        self.native.as_ref().ok_or(Error::MissingSession)
    }

    /// Release the native handle now instead of at drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(native) = self.native.take() {
            log::debug!("Freeing SSH session");
            self.transport.session_free(native);
        }
    }
}

impl<T: Transport> Drop for SshSession<T> {
    fn drop(&mut self) {
        self.release();
    }
}
