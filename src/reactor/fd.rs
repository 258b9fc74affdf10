//! FD registry (spec §3 "FD entry", §4.1 `register_fd`/`set_fd_events`/`close_fd`).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::cell::RefCell;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::reactor::Reactor;

/// Receives readiness notifications for one registered file descriptor.
///
/// `readable`/`writable` are the observed event mask intersected with the
/// handler's current interest (spec §4.1 step 3); a handler registered only
/// for `READABLE` never sees `writable == true` even if the kernel reported
/// it (spurious or hint-only readiness per the `mio` portability notes).
pub trait FdReadyHandler {
    fn on_ready(&mut self, reactor: &mut Reactor, readable: bool, writable: bool);
}

pub(crate) struct FdRegistration {
    pub(crate) interest: Interest,
    pub(crate) handler: Rc<RefCell<dyn FdReadyHandler>>,
}

#[derive(Default)]
pub(crate) struct FdRegistry {
    entries: HashMap<RawFd, FdRegistration>,
    next_token: usize,
    token_to_fd: HashMap<usize, RawFd>,
    fd_to_token: HashMap<RawFd, usize>,
}

impl FdRegistry {
    pub(crate) fn new() -> Self {
        FdRegistry {
            entries: HashMap::new(),
            next_token: 1, // Token(0) is reserved for the child-reap self-pipe.
            token_to_fd: HashMap::new(),
            fd_to_token: HashMap::new(),
        }
    }

    fn token_for(&mut self, fd: RawFd) -> Token {
        if let Some(&tok) = self.fd_to_token.get(&fd) {
            return Token(tok);
        }
        let tok = self.next_token;
        self.next_token += 1;
        self.fd_to_token.insert(fd, tok);
        self.token_to_fd.insert(tok, fd);
        Token(tok)
    }

    pub(crate) fn fd_for_token(&self, token: Token) -> Option<RawFd> {
        self.token_to_fd.get(&token.0).copied()
    }

    pub(crate) fn register(
        &mut self,
        registry: &Registry,
        fd: RawFd,
        interest: Interest,
        handler: Rc<RefCell<dyn FdReadyHandler>>,
    ) -> std::io::Result<()> {
        // Replaces any prior registration for the same fd (spec §4.1).
        if self.entries.contains_key(&fd) {
            self.deregister(registry, fd)?;
        }
        let token = self.token_for(fd);
        registry.register(&mut SourceFd(&fd), token, interest)?;
        self.entries.insert(fd, FdRegistration { interest, handler });
        Ok(())
    }

    pub(crate) fn set_interest(
        &mut self,
        registry: &Registry,
        fd: RawFd,
        interest: Interest,
    ) -> std::io::Result<()> {
        let token = match self.fd_to_token.get(&fd) {
            Some(&t) => Token(t),
            None => return Ok(()), // no-op on unknown fd (spec §4.1 failure modes)
        };
        if let Some(entry) = self.entries.get_mut(&fd) {
            entry.interest = interest;
        }
        registry.reregister(&mut SourceFd(&fd), token, interest)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry, fd: RawFd) -> std::io::Result<()> {
        if self.entries.remove(&fd).is_none() {
            return Ok(()); // no-op: unknown fd (spec §4.1 failure modes)
        }
        let _ = registry.deregister(&mut SourceFd(&fd));
        if let Some(tok) = self.fd_to_token.remove(&fd) {
            self.token_to_fd.remove(&tok);
        }
        Ok(())
    }

    pub(crate) fn handler(&self, fd: RawFd) -> Option<(Rc<RefCell<dyn FdReadyHandler>>, Interest)> {
        self.entries.get(&fd).map(|e| (e.handler.clone(), e.interest))
    }
}
