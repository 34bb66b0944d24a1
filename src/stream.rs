// src/stream.rs
use std::io;

use libc::{c_int, c_void};

use crate::error::{VersoError, VersoResult};
use crate::syscalls;

pub const BUFFER_SIZE_MIN: usize = 1024; /* 1 KiB */
pub const BUFFER_SIZE_MAX: usize = 65536; /* 64 KiB */

/// Largest amount handed to a single write syscall.
const WRITE_MAX: usize = 8192;

/// How long a blocked read or write may wait before giving up.
pub const TIMEOUT_MS: c_int = 10_000;

/// Buffered stream over a non-blocking socket descriptor.
///
/// The input buffer accumulates read-ahead between parser resumptions; the
/// output buffer coalesces small writes and holds back data a blocked socket
/// refused. After a flush empties either buffer it shrinks back to
/// [`BUFFER_SIZE_MIN`].
///
/// The stream does not own the descriptor; the connection that created it
/// decides between a graceful and an abortive close.
pub struct Stream {
    pub fd: c_int,
    input: Vec<u8>,
    input_index: usize,
    input_length: usize,
    output: Vec<u8>,
    output_index: usize,
    output_length: usize,
}

impl Stream {
    /// Wraps a descriptor, switching it to non-blocking mode.
    pub fn new(fd: c_int) -> VersoResult<Stream> {
        syscalls::set_nonblocking(fd)?;
        Ok(Stream {
            fd,
            input: vec![0; BUFFER_SIZE_MIN],
            input_index: 0,
            input_length: 0,
            output: vec![0; BUFFER_SIZE_MIN],
            output_index: 0,
            output_length: 0,
        })
    }

    /// Bytes already buffered and not yet consumed.
    pub fn cached(&self) -> usize {
        self.input_length - self.input_index
    }

    /// Returns a slice starting at the first unread byte holding at least
    /// `length` bytes, reading from the socket as needed. The slice covers
    /// everything currently buffered, which may be more than requested.
    pub fn read(&mut self, length: usize) -> VersoResult<&[u8]> {
        let mut available = self.input_length - self.input_index;

        if length > self.input.len() {
            if length > BUFFER_SIZE_MAX {
                return Err(VersoError::Memory);
            }
            // Round up to a multiple of 256 to avoid repeated one-byte
            // resizes on slowly growing requests.
            let size = (length + 0xff) & !0xff;
            self.input.resize(size, 0);
        }

        if length > available {
            // Realign so the requested window fits behind the unread data.
            if self.input_index + length > self.input.len() {
                self.input.copy_within(self.input_index..self.input_length, 0);
                self.input_index = 0;
                self.input_length = available;
            }

            loop {
                let size = unsafe {
                    libc::read(
                        self.fd,
                        self.input[self.input_length..].as_mut_ptr() as *mut c_void,
                        self.input.len() - self.input_length,
                    )
                };
                if size > 0 {
                    self.input_length += size as usize;
                    available += size as usize;
                    if available < length {
                        continue;
                    }
                    break;
                }
                if size == 0 {
                    return Err(VersoError::Network);
                }
                match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EAGAIN) => {
                        syscalls::poll_single(self.fd, libc::POLLIN, TIMEOUT_MS)?;
                    }
                    Some(libc::EINTR) => {}
                    Some(errno) => return Err(crate::error::errno_error(errno)),
                    None => return Err(VersoError::Unknown),
                }
            }
        }

        Ok(&self.input[self.input_index..self.input_length])
    }

    /// Marks `length` bytes as consumed. When the buffer drains completely it
    /// resets and shrinks back to the minimum size.
    pub fn read_flush(&mut self, length: usize) {
        self.input_index += length;
        debug_assert!(self.input_index <= self.input_length);

        if self.input_index == self.input_length {
            self.input_index = 0;
            self.input_length = 0;
            if self.input.len() > BUFFER_SIZE_MIN {
                self.input.truncate(BUFFER_SIZE_MIN);
                self.input.shrink_to_fit();
            }
        }
    }

    /// Enqueues `data`, sending as much as the socket accepts right now.
    /// Data the socket refuses is buffered up to [`BUFFER_SIZE_MAX`]; past
    /// that the call blocks in poll until the socket drains.
    pub fn write(&mut self, data: &[u8]) -> VersoResult<()> {
        // Send previously buffered output first.
        loop {
            let pending = self.output_length - self.output_index;
            if pending == 0 {
                break;
            }
            let written =
                self.write_some(self.output_index, pending)?;
            if written > 0 {
                self.output_index += written;
                if self.output_index == self.output_length {
                    self.output_index = 0;
                    self.output_length = 0;
                }
                continue;
            }

            // Nothing could be sent without blocking.
            if pending + data.len() > BUFFER_SIZE_MAX {
                syscalls::poll_single(self.fd, libc::POLLOUT, TIMEOUT_MS)?;
            } else {
                self.buffer_output(data);
                return Ok(());
            }
        }

        // Output buffer is now empty; send `data` directly.
        let mut index = 0;
        while index < data.len() {
            let remaining = data.len() - index;
            let written = self.write_direct(&data[index..])?;
            if written > 0 {
                index += written;
                continue;
            }

            if remaining > BUFFER_SIZE_MAX {
                syscalls::poll_single(self.fd, libc::POLLOUT, TIMEOUT_MS)?;
            } else {
                self.buffer_output(&data[index..]);
                return Ok(());
            }
        }

        Ok(())
    }

    /// Sends everything buffered, blocking in poll between attempts, then
    /// shrinks the output buffer.
    pub fn write_flush(&mut self) -> VersoResult<()> {
        loop {
            let pending = self.output_length - self.output_index;
            if pending == 0 {
                break;
            }
            let written = self.write_some(self.output_index, pending)?;
            if written > 0 {
                self.output_index += written;
                continue;
            }
            syscalls::poll_single(self.fd, libc::POLLOUT, TIMEOUT_MS)?;
        }

        self.output_index = 0;
        self.output_length = 0;
        if self.output.len() > BUFFER_SIZE_MIN {
            self.output.truncate(BUFFER_SIZE_MIN);
            self.output.shrink_to_fit();
        }
        Ok(())
    }

    // Single non-blocking send of a slice of the output buffer.
    // Returns 0 when the socket would block.
    fn write_some(&mut self, offset: usize, length: usize) -> VersoResult<usize> {
        let amount = length.min(WRITE_MAX);
        let status = unsafe {
            libc::write(
                self.fd,
                self.output[offset..].as_ptr() as *const c_void,
                amount,
            )
        };
        Self::write_status(status)
    }

    fn write_direct(&mut self, data: &[u8]) -> VersoResult<usize> {
        let amount = data.len().min(WRITE_MAX);
        let status =
            unsafe { libc::write(self.fd, data.as_ptr() as *const c_void, amount) };
        Self::write_status(status)
    }

    fn write_status(status: isize) -> VersoResult<usize> {
        if status >= 0 {
            return Ok(status as usize);
        }
        let error = crate::error::errno_error(
            io::Error::last_os_error().raw_os_error().unwrap_or(0),
        );
        if error == VersoError::Again {
            return Ok(0);
        }
        Err(error)
    }

    // Appends data behind any pending output, compacting and growing the
    // buffer as required. The caller has checked the 64 KiB cap.
    fn buffer_output(&mut self, data: &[u8]) {
        if self.output_index > 0 {
            self.output
                .copy_within(self.output_index..self.output_length, 0);
            self.output_length -= self.output_index;
            self.output_index = 0;
        }
        let total = self.output_length + data.len();
        if total > self.output.len() {
            self.output.resize(total, 0);
        }
        self.output[self.output_length..total].copy_from_slice(data);
        self.output_length = total;
    }
}
