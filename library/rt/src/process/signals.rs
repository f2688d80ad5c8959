//! Inter-process signals.
//!
//! Every cross-process effect is a signal appended to the receiver's FIFO
//! queue. Message payloads travel in heap fragments allocated by the
//! sender; the receiver links them into its own heap when it drains the
//! queue at a safe point. Because one queue carries both messages and
//! link/monitor/exit traffic, the ordering guarantee "exit notifications
//! follow all prior messages from the dying process" holds by
//! construction.

use std::collections::VecDeque;

use log::trace;

use crate::heap::{HeapFull, ProcessHeap};
use crate::process::mailbox::Message;
use crate::process::{collect_garbage, Process, ProcessBody, ProcessId};
use crate::term::{atoms, OpaqueTerm};

#[derive(Debug)]
pub enum Signal {
    /// An ordinary message; `root` lives in `fragment`.
    Message { sender: ProcessId, fragment: ProcessHeap, root: OpaqueTerm },
    /// An exit signal, either from a link partner's death (`from_link`) or
    /// an explicit `exit/2`.
    Exit { sender: ProcessId, fragment: ProcessHeap, reason: OpaqueTerm, from_link: bool },
    /// `exit(Pid, kill)`: unconditional, untrappable.
    Kill { sender: ProcessId },
    Link { from: ProcessId },
    Unlink { from: ProcessId },
    Monitor { from: ProcessId, reference: u64 },
    Demonitor { reference: u64 },
    Down { reference: u64, from: ProcessId, fragment: ProcessHeap, reason: OpaqueTerm },
    GroupLeader { leader: ProcessId },
    TraceChange { flags: u32 },
}

#[derive(Debug, Default)]
pub struct SignalQueue {
    queue: VecDeque<Signal>,
}

impl SignalQueue {
    pub fn push(&mut self, signal: Signal) {
        self.queue.push_back(signal);
    }

    pub fn pop(&mut self) -> Option<Signal> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// A fatal exit decided while draining signals. The reason term lives in
/// `fragment` until termination copies it for propagation.
#[derive(Debug)]
pub struct PendingExit {
    pub fragment: ProcessHeap,
    pub reason: OpaqueTerm,
    /// Result of `exit(Pid, kill)`: reported upstream as `killed`.
    pub killed: bool,
}

impl PendingExit {
    pub fn normal() -> Self {
        Self {
            fragment: ProcessHeap::fragment(),
            reason: OpaqueTerm::make_atom(atoms::NORMAL),
            killed: false,
        }
    }

    pub fn killed() -> Self {
        Self {
            fragment: ProcessHeap::fragment(),
            reason: OpaqueTerm::make_atom(atoms::KILLED),
            killed: true,
        }
    }
}

/// Routes a signal to `target`, waking it if it was parked in a receive.
/// Returns false when the target no longer exists.
pub fn send_to(target: ProcessId, signal: Signal) -> bool {
    let Some(process) = crate::process::table::lookup(target) else {
        trace!(target: "process", "dropping signal for dead pid {}", target);
        return false;
    };
    process.push_signal(signal);
    crate::scheduler::wake(&process);
    true
}

/// Copies `root` out of `fragment` into the process heap, collecting (and
/// growing) as needed.
fn link_into_heap(
    body: &mut ProcessBody,
    fragment: &ProcessHeap,
    root: OpaqueTerm,
) -> OpaqueTerm {
    loop {
        match body.heap.copy_from(fragment, root) {
            Ok(term) => return term,
            Err(HeapFull { need }) => {
                collect_garbage(body, need);
            }
        }
    }
}

/// Drains the signal queue at a safe point. Returns a fatal exit if one
/// was delivered; remaining signals stay queued and die with the process.
pub fn drain(process: &Process, body: &mut ProcessBody) -> Option<PendingExit> {
    loop {
        let signal = process.take_signal()?;
        match signal {
            Signal::Message { sender, fragment, root } => {
                let term = link_into_heap(body, &fragment, root);
                body.mailbox.push(Message { sender, term });
            }
            Signal::Kill { sender } => {
                trace!(target: "process", "{} killed by {}", process.pid(), sender);
                return Some(PendingExit::killed());
            }
            Signal::Exit { sender, fragment, reason, from_link } => {
                if from_link && !body.links.contains(&sender) {
                    // Stale notification from a link already removed
                    continue;
                }
                if from_link {
                    body.links.remove(&sender);
                }
                let trapping = process.traps_exits();
                let is_normal = reason == OpaqueTerm::make_atom(atoms::NORMAL);
                if trapping {
                    // {'EXIT', From, Reason} as an ordinary message
                    let tuple = build_exit_message(body, sender, &fragment, reason);
                    body.mailbox.push(Message { sender, term: tuple });
                } else if is_normal && sender != process.pid() {
                    // A normal exit from a peer is ignored unless trapped;
                    // a self-directed normal exit still terminates
                    continue;
                } else {
                    return Some(PendingExit { fragment, reason, killed: false });
                }
            }
            Signal::Down { reference, from, fragment, reason } => {
                // Deliver exactly once, and only while the monitor is live
                if body.monitors.unwatch(reference).is_some() {
                    let message = build_down_message(body, reference, from, &fragment, reason);
                    body.mailbox.push(Message { sender: from, term: message });
                }
            }
            Signal::Link { from } => {
                body.links.insert(from);
            }
            Signal::Unlink { from } => {
                body.links.remove(&from);
            }
            Signal::Monitor { from, reference } => {
                body.monitors.watched_by(reference, from);
            }
            Signal::Demonitor { reference } => {
                body.monitors.unwatched_by(reference);
            }
            Signal::GroupLeader { leader } => {
                body.group_leader = leader;
            }
            Signal::TraceChange { flags } => {
                body.trace_flags = flags;
            }
        }
    }
}

/// Builds `{'EXIT', From, Reason}` on the process heap. On exhaustion the
/// whole construction retries from the fragment, since a collection
/// invalidates any intermediate heap term we might hold.
fn build_exit_message(
    body: &mut ProcessBody,
    from: ProcessId,
    fragment: &ProcessHeap,
    reason: OpaqueTerm,
) -> OpaqueTerm {
    loop {
        let attempt = body.heap.copy_from(fragment, reason).and_then(|reason| {
            body.heap.tuple(&[
                OpaqueTerm::make_atom(atoms::EXIT_TAG),
                OpaqueTerm::make_pid(from),
                reason,
            ])
        });
        match attempt {
            Ok(term) => return term,
            Err(HeapFull { need }) => {
                collect_garbage(body, need);
            }
        }
    }
}

/// Builds `{'DOWN', Ref, process, Pid, Reason}` on the process heap.
fn build_down_message(
    body: &mut ProcessBody,
    reference: u64,
    from: ProcessId,
    fragment: &ProcessHeap,
    reason: OpaqueTerm,
) -> OpaqueTerm {
    loop {
        let attempt = body.heap.copy_from(fragment, reason).and_then(|reason| {
            body.heap.tuple(&[
                OpaqueTerm::make_atom(atoms::DOWN),
                OpaqueTerm::make_ref(reference),
                OpaqueTerm::make_atom(atoms::PROCESS),
                OpaqueTerm::make_pid(from),
                reason,
            ])
        });
        match attempt {
            Ok(term) => return term,
            Err(HeapFull { need }) => {
                collect_garbage(body, need);
            }
        }
    }
}
