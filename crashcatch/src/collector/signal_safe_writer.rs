// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::REPORT_BUFFER_LEN;
use std::io::{self, Write};
use std::os::fd::RawFd;

/// A [`Write`] implementation usable from a signal handler.
///
/// `std::io::Stderr` and `File` are not an option there: stderr takes a reentrant lock, and
/// `BufWriter` allocates.  This writer stages bytes in a fixed buffer that lives wherever the
/// writer lives (the signal stack) and hands them to `write(2)`, which is async-signal safe.
/// Interrupted and partial writes are retried.
///
/// The writer does not own the file descriptor and never closes it.
pub(crate) struct SignalSafeWriter {
    fd: RawFd,
    buf: [u8; REPORT_BUFFER_LEN],
    len: usize,
}

impl SignalSafeWriter {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: [0; REPORT_BUFFER_LEN],
            len: 0,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.len {
            let remaining = &self.buf[written..self.len];
            // SAFETY: `remaining` is a valid slice for its whole length.
            let rval = unsafe {
                libc::write(
                    self.fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if rval < 0 {
                let errno = errno::errno().0;
                if errno == libc::EINTR {
                    continue;
                }
                // Drop what we could not write, the next section may still make it out.
                self.len = 0;
                return Err(io::Error::from_raw_os_error(errno));
            }
            if rval == 0 {
                self.len = 0;
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += rval as usize;
        }
        self.len = 0;
        Ok(())
    }
}

impl Write for SignalSafeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.len == self.buf.len() {
            self.flush_buffer()?;
        }
        let count = std::cmp::min(data.len(), self.buf.len() - self.len);
        self.buf[self.len..self.len + count].copy_from_slice(&data[..count]);
        self.len += count;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

impl Drop for SignalSafeWriter {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}
