//! Owned wrapper around the low-level protocol connection.

use std::os::unix::io::RawFd;

use crate::protocol::RawConnection;

/// Move-only owner of at most one [`RawConnection`].
///
/// The null state is valid and means "closed". Dropping a non-null handle
/// closes the underlying descriptor.
#[derive(Debug, Default)]
pub struct NativeHandle {
    raw: Option<RawConnection>,
}

impl NativeHandle {
    /// The null handle.
    pub fn null() -> Self {
        Self { raw: None }
    }

    /// Wrap an established or establishing protocol connection.
    pub fn new(raw: RawConnection) -> Self {
        Self { raw: Some(raw) }
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    pub fn get(&self) -> Option<&RawConnection> {
        self.raw.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut RawConnection> {
        self.raw.as_mut()
    }

    /// Take ownership of the protocol connection, leaving the handle null.
    pub fn take(&mut self) -> Option<RawConnection> {
        self.raw.take()
    }

    /// The file descriptor of the live descriptor, if any.
    pub fn socket(&self) -> Option<RawFd> {
        self.raw.as_ref().map(RawConnection::socket)
    }
}

impl From<RawConnection> for NativeHandle {
    fn from(raw: RawConnection) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_has_no_socket() {
        let handle = NativeHandle::null();
        assert!(handle.is_null());
        assert!(handle.get().is_none());
        assert!(handle.socket().is_none());
    }

    #[test]
    fn take_leaves_handle_null() {
        let mut handle = NativeHandle::null();
        assert!(handle.take().is_none());
        assert!(handle.is_null());
    }
}
