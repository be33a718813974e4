// src/utils.rs

//! A collection of utility functions for platform-specific operations.
//!
//! This module provides helpers for:
//! - Interacting with Android properties and SELinux contexts.
//! - Binding labelled Unix sockets and passing descriptors over them.
//! - Reading the credentials of a connected peer.

use crate::auth::PeerIdentity;
use anyhow::{Result, bail};
use rustix::net::{
    AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, SocketAddrUnix, SocketType, bind, listen, recvmsg, sendmsg,
    socket, sockopt,
};
use rustix::thread as rustix_thread;
use std::fs;
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};

// --- Platform-specific Macros ---

/// Selects an expression based on the target pointer width (32-bit vs 64-bit).
#[cfg(target_pointer_width = "64")]
#[macro_export]
macro_rules! lp_select {
    ($lp32:expr, $lp64:expr) => {
        $lp64
    };
}
#[cfg(target_pointer_width = "32")]
#[macro_export]
macro_rules! lp_select {
    ($lp32:expr, $lp64:expr) => {
        $lp32
    };
}

/// Locks `mutex`, carrying on with the inner value if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- SELinux and Android Property Utilities ---

/// Sets the SELinux context for socket creation for the current thread.
pub fn set_socket_create_context(context: &str) -> Result<()> {
    // Try the modern path first.
    let path = "/proc/thread-self/attr/sockcreate";
    if fs::write(path, context).is_ok() {
        return Ok(());
    }
    // Fallback for older kernels.
    let fallback_path = format!(
        "/proc/self/task/{}/attr/sockcreate",
        rustix_thread::gettid().as_raw_nonzero()
    );
    fs::write(fallback_path, context)?;
    Ok(())
}

/// Changes the SELinux context of a file using the `chcon` command.
pub fn chcon(path: &str, context: &str) -> Result<()> {
    let status = Command::new("chcon").arg(context).arg(path).status()?;
    if !status.success() {
        bail!("chcon {} {} exited with {}", context, path, status);
    }
    Ok(())
}

/// Retrieves an Android system property value.
#[cfg(target_os = "android")]
pub fn get_property(name: &str) -> Result<String> {
    use std::ffi::{CString, c_char};

    unsafe extern "C" {
        fn __system_property_get(name: *const c_char, value: *mut c_char) -> u32;
    }

    let name = CString::new(name)?;
    let mut buf = vec![0u8; 92]; // PROP_VALUE_MAX
    let len = unsafe { __system_property_get(name.as_ptr(), buf.as_mut_ptr() as *mut c_char) };
    if len > 0 {
        Ok(String::from_utf8_lossy(&buf[..len as usize]).to_string())
    } else {
        Ok(String::new())
    }
}

/// Properties only exist on Android; elsewhere every property is unset.
#[cfg(not(target_os = "android"))]
pub fn get_property(_name: &str) -> Result<String> {
    Ok(String::new())
}

/// Platform SDK level, or 0 when it cannot be determined.
pub fn sdk_version() -> i32 {
    get_property("ro.build.version.sdk")
        .ok()
        .and_then(|sdk| sdk.trim().parse().ok())
        .unwrap_or(0)
}

/// Whether the vendor ROM needs the helper binding for manager sessions.
pub fn is_miui() -> bool {
    get_property("ro.miui.ui.version.name").is_ok_and(|name| !name.is_empty())
}

// --- Unix Socket Utilities ---

/// Creates a `UnixListener` bound to a given path, handling file cleanup and SELinux contexts.
///
/// A failure to label the socket file is only logged.
pub fn unix_listener_from_path(path: &str, file_context: Option<&str>) -> Result<UnixListener> {
    let _ = fs::remove_file(path);
    let addr = SocketAddrUnix::new(path)?;
    let socket = socket(AddressFamily::UNIX, SocketType::STREAM, None)?;
    bind(&socket, &addr)?;
    listen(&socket, 10)?; // Backlog of 10
    if let Some(context) = file_context {
        if let Err(e) = chcon(path, context) {
            log::error!("Failed to label {} as {}: {}", path, context, e);
        }
    }
    Ok(UnixListener::from(socket))
}

/// Sends `fd` as ancillary data together with the single payload byte `byte`.
pub fn send_fd_with_byte(stream: &UnixStream, fd: BorrowedFd<'_>, byte: u8) -> Result<()> {
    let fds = [fd];
    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !control.push(SendAncillaryMessage::ScmRights(&fds)) {
        bail!("control buffer too small");
    }
    let sent = sendmsg(stream, &[IoSlice::new(&[byte])], &mut control, SendFlags::NOSIGNAL)?;
    if sent != 1 {
        bail!("sent {} bytes instead of 1", sent);
    }
    Ok(())
}

/// Receives one payload byte and the descriptor attached to it.
pub fn recv_fd_with_byte(stream: &UnixStream) -> Result<(u8, OwnedFd)> {
    let mut payload = [0u8; 1];
    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(1))];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let received = recvmsg(
        stream,
        &mut [IoSliceMut::new(&mut payload)],
        &mut control,
        RecvFlags::CMSG_CLOEXEC,
    )?;
    if received.bytes == 0 {
        bail!("connection closed before the payload arrived");
    }
    let fd = control.drain().find_map(|message| match message {
        RecvAncillaryMessage::ScmRights(mut fds) => fds.next(),
        _ => None,
    });
    let Some(fd) = fd else {
        bail!("no descriptor attached to the payload");
    };
    Ok((payload[0], fd))
}

/// Reads the uid/pid and SELinux label of the process on the other end of `stream`.
pub fn peer_identity(stream: &UnixStream) -> std::io::Result<PeerIdentity> {
    let cred = sockopt::socket_peercred(stream)?;
    let identity = PeerIdentity::new(cred.uid.as_raw(), cred.pid.as_raw_nonzero().get());
    Ok(match peer_label(stream) {
        Some(label) => identity.with_label(label),
        None => identity,
    })
}

/// `SO_PEERSEC` of `stream`; kernels without SELinux reject the query.
fn peer_label(stream: &UnixStream) -> Option<String> {
    let mut label = vec![0u8; 256];
    let mut len = label.len() as libc::socklen_t;
    // SAFETY: `label` is writable for `len` bytes.
    let ret = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERSEC,
            label.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if ret != 0 {
        return None;
    }
    label.truncate(len as usize);
    while label.last() == Some(&0) {
        label.pop();
    }
    (!label.is_empty()).then(|| String::from_utf8_lossy(&label).into_owned())
}
