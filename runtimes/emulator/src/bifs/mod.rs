//! The built-in function layer.
//!
//! BIFs run inline on the calling scheduler. Each receives a [`BifContext`]
//! that exposes the argument window by position — arguments are re-read
//! from the register file on every access, so a collection triggered by
//! an allocating helper can never leave a BIF holding a stale term.
//! Reduction costs are charged through the context: the default is one,
//! size-proportional BIFs charge `1 + size/64`.

pub mod erlang;

use std::sync::Arc;

use hashbrown::HashMap;
use lazy_static::lazy_static;

use ember_rt::error::Exception;
use ember_rt::heap::HeapFull;
use ember_rt::process::{collect_garbage, Process, ProcessBody};
use ember_rt::scheduler::Scheduler;
use ember_rt::term::{Atom, OpaqueTerm};

pub enum BifOutcome {
    Value(OpaqueTerm),
    Halt(i32),
}

pub type Bif = fn(&mut BifContext<'_>) -> Result<BifOutcome, Exception>;

pub struct BifContext<'a> {
    pub scheduler: &'a Scheduler,
    pub process: &'a Arc<Process>,
    pub body: &'a mut ProcessBody,
    base: u16,
    arity: u8,
    pub reds: &'a mut i64,
}

impl<'a> BifContext<'a> {
    pub fn new(
        scheduler: &'a Scheduler,
        process: &'a Arc<Process>,
        body: &'a mut ProcessBody,
        base: u16,
        arity: u8,
        reds: &'a mut i64,
    ) -> Self {
        Self { scheduler, process, body, base, arity, reds }
    }

    /// The i-th argument, read fresh from the register window.
    #[inline]
    pub fn arg(&self, i: usize) -> OpaqueTerm {
        debug_assert!(i < self.arity as usize);
        self.body.regs[self.base as usize + i]
    }

    pub fn arity(&self) -> usize {
        self.arity as usize
    }

    /// Absolute register index of argument `i`; build closures capture
    /// this to re-read arguments across a collection.
    pub fn arg_register(&self, i: usize) -> usize {
        self.base as usize + i
    }

    pub fn charge(&mut self, cost: i64) {
        *self.reds -= cost;
    }

    /// Runs an allocating construction, collecting and retrying on
    /// exhaustion. The closure must re-read its inputs (e.g. via
    /// register indices) on every attempt.
    pub fn build(
        &mut self,
        mut f: impl FnMut(&mut ProcessBody) -> Result<OpaqueTerm, HeapFull>,
    ) -> OpaqueTerm {
        with_retry(self.body, &mut f)
    }
}

/// Collect-and-retry helper shared by the BIF and NIF glue.
pub fn with_retry<T>(
    body: &mut ProcessBody,
    f: &mut impl FnMut(&mut ProcessBody) -> Result<T, HeapFull>,
) -> T {
    loop {
        match f(body) {
            Ok(value) => return value,
            Err(HeapFull { need }) => {
                collect_garbage(body, need);
            }
        }
    }
}

struct BifTable {
    entries: HashMap<(Atom, Atom, u8), Bif>,
    erlang: Atom,
    apply: Atom,
}

impl BifTable {
    fn build() -> Self {
        let erlang = Atom::intern("erlang").expect("atom table exhausted at boot");
        let apply = Atom::intern("apply").expect("atom table exhausted at boot");
        let mut entries = HashMap::new();
        erlang::register(&mut entries);
        Self { entries, erlang, apply }
    }
}

lazy_static! {
    static ref TABLE: BifTable = BifTable::build();
}

pub fn lookup(module: Atom, function: Atom, arity: u8) -> Option<Bif> {
    TABLE.entries.get(&(module, function, arity)).copied()
}

/// The `erlang` module atom (BIF namespace and `apply/3` interception).
pub fn erlang_module() -> Atom {
    TABLE.erlang
}

pub fn apply_atom() -> Atom {
    TABLE.apply
}
