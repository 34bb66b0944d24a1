// src/worker.rs
use std::sync::Arc;
use std::thread;

use libc::c_int;
use tracing::{debug, error};

use crate::conn::Session;
use crate::error::VersoResult;
use crate::handlers;
use crate::server::ServerState;
use crate::syscalls;

/// What a worker reports back when it finishes a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Response sent; keep parsing on this connection.
    KeepAlive,
    /// Response sent; close the connection gracefully.
    Close,
    /// No response was possible; close with RST.
    Abort,
}

impl Outcome {
    fn to_word(self) -> usize {
        match self {
            Outcome::KeepAlive => 0,
            Outcome::Close => 1,
            Outcome::Abort => 2,
        }
    }

    fn from_word(word: usize) -> Outcome {
        match word {
            0 => Outcome::KeepAlive,
            1 => Outcome::Close,
            _ => Outcome::Abort,
        }
    }
}

struct WorkerSlot {
    request_write: c_int,
    response_read: c_int,
    busy: u32,
}

/// Fixed pool of handler threads. Each worker owns a request pipe
/// (dispatcher to worker) and a response pipe (worker to dispatcher); both
/// carry pointer-sized messages, which POSIX pipes transfer atomically.
///
/// A session travels to a worker as a raw `Box` pointer and comes back the
/// same way together with the outcome, so exactly one side owns it at any
/// moment.
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    handles: Vec<thread::JoinHandle<()>>,
    next: usize,
}

impl WorkerPool {
    pub fn start(count: usize, state: Arc<ServerState>) -> VersoResult<WorkerPool> {
        let mut slots = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for index in 0..count {
            let (request_read, request_write) = syscalls::create_pipe()?;
            let (response_read, response_write) = syscalls::create_pipe()?;

            let state = state.clone();
            let handle = thread::Builder::new()
                .name(format!("verso-worker-{}", index))
                .spawn(move || worker_loop(index, request_read, response_write, state))
                .map_err(|e| crate::error::VersoError::from(e))?;

            slots.push(WorkerSlot {
                request_write,
                response_read,
                busy: 0,
            });
            handles.push(handle);
        }

        Ok(WorkerPool {
            slots,
            handles,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Descriptor the dispatcher polls while `worker` handles a session.
    pub fn response_fd(&self, worker: usize) -> c_int {
        self.slots[worker].response_read
    }

    /// Picks the first idle worker, falling back to round-robin when all of
    /// them are busy.
    pub fn pick(&mut self) -> usize {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.busy == 0 {
                return index;
            }
        }
        let worker = self.next;
        self.next = (self.next + 1) % self.slots.len();
        worker
    }

    /// Moves the session to `worker`. Ownership transfers with the pointer;
    /// the dispatcher must not touch the session until `collect` returns it.
    /// On a pipe failure the session comes back to the caller.
    pub fn dispatch(&mut self, worker: usize, session: Box<Session>) -> Result<(), Box<Session>> {
        let pointer = Box::into_raw(session) as usize;
        if let Err(error) = syscalls::pipe_send(self.slots[worker].request_write, &[pointer]) {
            error!(worker, error = %error, "request pipe failed");
            // Retake ownership so the session is not leaked.
            return Err(unsafe { Box::from_raw(pointer as *mut Session) });
        }
        self.slots[worker].busy += 1;
        Ok(())
    }

    /// Receives a completed session back from `worker`.
    pub fn collect(&mut self, worker: usize) -> VersoResult<(Box<Session>, Outcome)> {
        let mut words = [0usize; 2];
        if !syscalls::pipe_recv(self.slots[worker].response_read, &mut words)? {
            return Err(crate::error::VersoError::Network);
        }
        self.slots[worker].busy -= 1;
        let session = unsafe { Box::from_raw(words[0] as *mut Session) };
        Ok((session, Outcome::from_word(words[1])))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the request pipes lets every worker fall out of its read
        // loop; join before releasing the response pipes.
        for slot in &self.slots {
            syscalls::close_fd(slot.request_write);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        for slot in &self.slots {
            syscalls::close_fd(slot.response_read);
        }
    }
}

fn worker_loop(index: usize, request_read: c_int, response_write: c_int, state: Arc<ServerState>) {
    debug!(worker = index, "worker started");
    loop {
        let mut words = [0usize; 1];
        match syscalls::pipe_recv(request_read, &mut words) {
            Ok(true) => {}
            Ok(false) => break, // dispatcher closed the pipe
            Err(e) => {
                error!(worker = index, error = %e, "request pipe failed");
                break;
            }
        }

        // The dispatcher moved this session to us through the pipe.
        let mut session = unsafe { Box::from_raw(words[0] as *mut Session) };
        let outcome = handlers::serve(&mut session, &state);

        let pointer = Box::into_raw(session) as usize;
        if let Err(e) = syscalls::pipe_send(response_write, &[pointer, outcome.to_word()]) {
            error!(worker = index, error = %e, "response pipe failed");
            drop(unsafe { Box::from_raw(pointer as *mut Session) });
            break;
        }
    }
    debug!(worker = index, "worker exiting");
    syscalls::close_fd(request_read);
    syscalls::close_fd(response_write);
}
