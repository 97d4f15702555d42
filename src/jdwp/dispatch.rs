//! Command-set/command dispatch table (spec.md §4.11).
//!
//! A static `(cmdSet, cmd)` → handler map. The dispatcher's own job is
//! bookkeeping around the handler call: publish that the requesting
//! mutator is RUNNING, timestamp debugger activity, and let any in-flight
//! event post drain before running the handler.

use super::mailbox::EventThreadMailbox;
use super::packet::Packet;
use crate::util::address::Address;
use crate::util::atomics::Quasi64;
use crate::util::error::JdwpError;
use std::collections::HashMap;

/// JDWP 1.5 command-set identifiers spec.md §6 lists as covered.
pub mod command_set {
    pub const VIRTUAL_MACHINE: u8 = 1;
    pub const REFERENCE_TYPE: u8 = 2;
    pub const CLASS_TYPE: u8 = 3;
    pub const ARRAY_TYPE: u8 = 4;
    pub const METHOD: u8 = 6;
    pub const OBJECT_REFERENCE: u8 = 9;
    pub const STRING_REFERENCE: u8 = 10;
    pub const THREAD_REFERENCE: u8 = 11;
    pub const THREAD_GROUP_REFERENCE: u8 = 12;
    pub const ARRAY_REFERENCE: u8 = 13;
    pub const CLASS_LOADER_REFERENCE: u8 = 14;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const CLASS_OBJECT_REFERENCE: u8 = 17;
    pub const EVENT: u8 = 64;
    pub const DDM: u8 = 199;
}

pub type Handler = Box<dyn Fn(&[u8], &mut Vec<u8>) -> Result<(), JdwpError> + Send + Sync>;

/// Bookkeeping a dispatched request performs around the handler call,
/// supplied by the embedding runtime.
pub struct DispatchContext<'a> {
    pub mailbox: &'a EventThreadMailbox,
    pub last_activity_when: &'a Quasi64,
    pub last_activity_addr: Address,
    pub set_thread_running: &'a dyn Fn(),
}

pub struct Dispatcher {
    handlers: HashMap<(u8, u8), Handler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher { handlers: HashMap::new() }
    }

    pub fn register(&mut self, cmd_set: u8, cmd: u8, handler: Handler) {
        self.handlers.insert((cmd_set, cmd), handler);
    }

    /// Dispatches a single request packet, running the handler and
    /// producing its reply. Unknown `(cmdSet, cmd)` pairs reply
    /// `NOT_IMPLEMENTED`; a handler that returns `Err` has its error
    /// folded into the reply header with an empty body.
    pub fn dispatch(&self, request: &Packet, ctx: &DispatchContext<'_>) -> Packet {
        let (id, cmd_set, cmd, data) = match request {
            Packet::Request { id, cmd_set, cmd, data } => (*id, *cmd_set, *cmd, data),
            Packet::Reply { .. } => return Packet::reply_err(request.id(), JdwpError::IllegalArgument),
        };

        (ctx.set_thread_running)();
        if cmd_set != command_set::DDM {
            ctx.last_activity_when.swap(ctx.last_activity_addr, now_millis());
        }
        ctx.mailbox.clear_wait_for_event_thread();

        let mut body = Vec::new();
        let result = match self.handlers.get(&(cmd_set, cmd)) {
            Some(handler) => handler(data, &mut body),
            None => Err(JdwpError::NotImplemented),
        };

        match result {
            Ok(()) => Packet::reply_ok(id, body),
            Err(err) => Packet::reply_err(id, err),
        }
    }
}

/// Wall-clock milliseconds since the epoch, used to stamp
/// `lastActivityWhen`. Kept as a free function so tests can see the exact
/// call site without needing a real clock dependency injected everywhere.
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(mailbox: &'a EventThreadMailbox, clock: &'a Quasi64, addr: Address) -> DispatchContext<'a> {
        DispatchContext {
            mailbox,
            last_activity_when: clock,
            last_activity_addr: addr,
            set_thread_running: &|| {},
        }
    }

    #[test]
    fn unknown_command_is_not_implemented() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(command_set::VIRTUAL_MACHINE, 1, Box::new(|_data, _reply| Ok(())));
        let mailbox = EventThreadMailbox::new();
        let clock = Quasi64::new(0);
        let addr = unsafe { Address::from_usize(0x1000) };
        let ctx = context(&mailbox, &clock, addr);

        let request = Packet::Request { id: 1, cmd_set: command_set::VIRTUAL_MACHINE, cmd: 99, data: vec![] };
        let reply = dispatcher.dispatch(&request, &ctx);
        match reply {
            Packet::Reply { error, .. } => assert_eq!(error, JdwpError::NotImplemented.code()),
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn known_command_runs_handler_and_stamps_activity() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            command_set::VIRTUAL_MACHINE,
            1,
            Box::new(|_data, reply| {
                reply.extend_from_slice(&[1, 2, 3]);
                Ok(())
            }),
        );
        let mailbox = EventThreadMailbox::new();
        let clock = Quasi64::new(0);
        let addr = unsafe { Address::from_usize(0x2000) };
        let ctx = context(&mailbox, &clock, addr);

        let request = Packet::Request { id: 7, cmd_set: command_set::VIRTUAL_MACHINE, cmd: 1, data: vec![] };
        let reply = dispatcher.dispatch(&request, &ctx);
        match reply {
            Packet::Reply { id, error, data } => {
                assert_eq!(id, 7);
                assert_eq!(error, JdwpError::None.code());
                assert_eq!(data, vec![1, 2, 3]);
            }
            _ => panic!("expected reply"),
        }
        assert!(clock.read(addr) > 0);
    }

    #[test]
    fn ddm_packet_does_not_update_activity_clock() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(command_set::DDM, 1, Box::new(|_data, _reply| Ok(())));
        let mailbox = EventThreadMailbox::new();
        let clock = Quasi64::new(0);
        let addr = unsafe { Address::from_usize(0x3000) };
        let ctx = context(&mailbox, &clock, addr);

        let request = Packet::Request { id: 1, cmd_set: command_set::DDM, cmd: 1, data: vec![] };
        dispatcher.dispatch(&request, &ctx);
        assert_eq!(clock.read(addr), 0);
    }

    #[test]
    fn dispatch_clears_any_in_flight_event_mailbox() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(command_set::VIRTUAL_MACHINE, 1, Box::new(|_data, _reply| Ok(())));
        let mailbox = EventThreadMailbox::new();
        mailbox.set_wait_for_event_thread(42);
        let clock = Quasi64::new(0);
        let addr = unsafe { Address::from_usize(0x4000) };
        let ctx = context(&mailbox, &clock, addr);

        let request = Packet::Request { id: 1, cmd_set: command_set::VIRTUAL_MACHINE, cmd: 1, data: vec![] };
        dispatcher.dispatch(&request, &ctx);
        assert!(!mailbox.is_claimed());
    }
}
