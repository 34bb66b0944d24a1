// src/syscalls.rs
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{VersoError, VersoResult};

const LISTEN_BACKLOG: c_int = 10;

// ---- Socket operations ----

/// Create a blocking TCP listener with SO_REUSEADDR bound to `addr`.
/// The dispatcher only accepts when poll reports the descriptor readable, so
/// the listener itself stays blocking.
pub fn create_listen_socket(addr: &SocketAddr) -> VersoResult<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(last_error());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let a = match addr {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => {
                libc::close(fd);
                return Err(VersoError::Unsupported);
            }
        };
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: a.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = last_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let err = last_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection. Returns `None` when the accept queue is
/// empty or the handshake was aborted before we got to it.
pub fn accept_connection(listen_fd: c_int) -> VersoResult<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut address: libc::sockaddr_in = mem::zeroed();
        let mut address_len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut address as *mut _ as *mut libc::sockaddr,
            &mut address_len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ECONNABORTED) | Some(libc::EINTR) => Ok(None),
                _ => Err(err.into()),
            };
        }

        let ip = std::net::Ipv4Addr::from(u32::from_be(address.sin_addr.s_addr));
        let port = u16::from_be(address.sin_port);
        Ok(Some((fd, SocketAddr::from((ip, port)))))
    }
}

pub fn set_nonblocking(fd: c_int) -> VersoResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(last_error());
        }
    }
    Ok(())
}

// Accepted sockets are armed with SO_LINGER so that an abortive close sends
// RST. Buggy clients report no error on a premature clean close; the reset
// is observable. A graceful close must disarm the linger first.

pub fn linger_arm(fd: c_int) {
    set_linger(fd, 1);
}

/// Disarm linger and close: the peer sees an orderly FIN.
pub fn close_graceful(fd: c_int) {
    set_linger(fd, 0);
    unsafe {
        libc::close(fd);
    }
}

/// Close with linger still armed: the peer sees RST.
pub fn close_abortive(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

fn set_linger(fd: c_int, onoff: c_int) {
    let linger = libc::linger {
        l_onoff: onoff,
        l_linger: 0,
    };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        );
    }
}

// ---- Dispatcher/worker pipes ----

/// Create a blocking Unix pipe. Returns (read_fd, write_fd). Both ends stay
/// blocking: the worker parks in read() between jobs and the dispatcher only
/// reads after poll reports data.
pub fn create_pipe() -> VersoResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(last_error());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write one pointer-sized message to a pipe. Messages of this size are
/// written atomically by POSIX pipes.
pub fn pipe_send(fd: c_int, words: &[usize]) -> VersoResult<()> {
    let bytes = words.len() * mem::size_of::<usize>();
    unsafe {
        let n = libc::write(fd, words.as_ptr() as *const c_void, bytes);
        if n != bytes as isize {
            return Err(last_error());
        }
    }
    Ok(())
}

/// Read exactly `words.len()` pointer-sized values from a pipe. Returns
/// `false` on end of file (all write ends closed).
pub fn pipe_recv(fd: c_int, words: &mut [usize]) -> VersoResult<bool> {
    let bytes = words.len() * mem::size_of::<usize>();
    let mut read = 0usize;
    while read < bytes {
        unsafe {
            let n = libc::read(
                fd,
                (words.as_mut_ptr() as *mut u8).add(read) as *mut c_void,
                bytes - read,
            );
            if n == 0 {
                return Ok(false);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
            read += n as usize;
        }
    }
    Ok(true)
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Poll ----

pub fn pollfd(fd: c_int, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Wait for events on the whole pollset. EINTR reports zero ready entries.
pub fn poll_wait(fds: &mut [libc::pollfd], timeout_ms: c_int) -> VersoResult<usize> {
    unsafe {
        let res = libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }
        Ok(res as usize)
    }
}

/// Block until `fd` reports `event` or `timeout_ms` passes.
/// Timeout maps to `Again`, an error or hangup condition to `Network`.
pub fn poll_single(fd: c_int, event: libc::c_short, timeout_ms: c_int) -> VersoResult<()> {
    let mut wait = pollfd(fd, event);
    loop {
        unsafe {
            let status = libc::poll(&mut wait, 1, timeout_ms);
            if status > 0 {
                if wait.revents & event != 0 {
                    return Ok(());
                }
                return Err(VersoError::Network);
            }
            if status < 0 {
                let errno = io::Error::last_os_error().raw_os_error();
                if errno == Some(libc::EINTR) || errno == Some(libc::EAGAIN) {
                    continue;
                }
            }
            return Err(VersoError::Again);
        }
    }
}

fn last_error() -> VersoError {
    io::Error::last_os_error().into()
}
