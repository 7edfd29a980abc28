//! `SCM_RIGHTS` transfer over tokio Unix streams.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::ptr;

use tokio::io::Interest;
use tokio::net::UnixStream;

/// Room for exactly one descriptor, as `u64`s so the buffer is aligned for
/// `cmsghdr`.
const CONTROL_WORDS: usize = 4;

fn control_space() -> usize {
    // SAFETY: pure size computation.
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }
}

/// Sends `payload` with `fd` attached as ancillary data.
pub async fn send_fd(stream: &UnixStream, payload: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
    let sent = stream
        .async_io(Interest::WRITABLE, || {
            send_with_fd(stream.as_raw_fd(), payload, fd.as_raw_fd())
        })
        .await?;
    if sent < payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short handoff write: {sent} of {} bytes", payload.len()),
        ));
    }
    Ok(())
}

/// Receives up to `buf.len()` bytes and the descriptor attached to them, if
/// any.
pub async fn recv_fd(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    stream
        .async_io(Interest::READABLE, || recv_with_fd(stream.as_raw_fd(), buf))
        .await
}

fn send_with_fd(socket: RawFd, payload: &[u8], fd: RawFd) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];
    let space = control_space();
    debug_assert!(space <= mem::size_of_val(&control));

    // SAFETY: msghdr is plain old data, every pointer set below outlives the
    // sendmsg call and the control buffer is large enough for one cmsg.
    let sent = unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);

        libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL)
    };

    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

fn recv_with_fd(socket: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];

    // SAFETY: as in send_with_fd; descriptors found in the control buffer
    // were installed into this process by the kernel and are owned by us.
    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let received = libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC);
        if received < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let len = (*cmsg).cmsg_len as usize - (data as usize - cmsg as usize);
                for i in 0..len / mem::size_of::<RawFd>() {
                    let fd = ptr::read_unaligned(data.cast::<RawFd>().add(i));
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ancillary data truncated",
            ));
        }
        if fds.len() > 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected one descriptor, received {}", fds.len()),
            ));
        }

        Ok((received as usize, fds.pop()))
    }
}
