//! Language-level exceptions.
//!
//! Exceptions unwind within a single process and never cross process
//! boundaries; an uncaught exception becomes the process exit reason
//! (wrapped per class: a `throw` becomes `{nocatch, Reason}`, an `error`
//! pairs with its stack trace).

use crate::term::{atoms, Atom, OpaqueTerm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Throw,
    Error,
    Exit,
}

impl ExceptionClass {
    pub fn as_atom(self) -> Atom {
        match self {
            Self::Throw => atoms::THROW,
            Self::Error => atoms::ERROR,
            Self::Exit => atoms::EXIT,
        }
    }

    pub fn from_atom(atom: Atom) -> Option<Self> {
        match atom {
            a if a == atoms::THROW => Some(Self::Throw),
            a if a == atoms::ERROR => Some(Self::Error),
            a if a == atoms::EXIT => Some(Self::Exit),
            _ => None,
        }
    }
}

/// An in-flight exception. `reason` and `trace` live on the heap of the
/// process that raised it.
#[derive(Debug, Clone, Copy)]
pub struct Exception {
    pub class: ExceptionClass,
    pub reason: OpaqueTerm,
    pub trace: OpaqueTerm,
}

impl Exception {
    pub fn error(reason: OpaqueTerm) -> Self {
        Self { class: ExceptionClass::Error, reason, trace: OpaqueTerm::NIL }
    }

    pub fn throw(reason: OpaqueTerm) -> Self {
        Self { class: ExceptionClass::Throw, reason, trace: OpaqueTerm::NIL }
    }

    pub fn exit(reason: OpaqueTerm) -> Self {
        Self { class: ExceptionClass::Exit, reason, trace: OpaqueTerm::NIL }
    }

    /// The stock `badarg` error.
    pub fn badarg() -> Self {
        Self::error(OpaqueTerm::make_atom(atoms::BADARG))
    }

    pub fn badarith() -> Self {
        Self::error(OpaqueTerm::make_atom(atoms::BADARITH))
    }

    pub fn undef() -> Self {
        Self::error(OpaqueTerm::make_atom(atoms::UNDEF))
    }

    pub fn system_limit() -> Self {
        Self::error(OpaqueTerm::make_atom(atoms::SYSTEM_LIMIT))
    }
}
