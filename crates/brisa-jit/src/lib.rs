//! The translation and execution core: per-page bytecode compilation with
//! flag-update elision, the dispatching engine, the physical-page code cache
//! with invalidation on write, and the segmented/paged memory layer glued to
//! the host's [`Bus`].
//!
//! [`Jit::step`] runs exactly one guest instruction (or delivers one pending
//! event), so a machine loop can interleave device work at instruction
//! granularity. The host invalidates compiled code through
//! [`Jit::addr_changed`] whenever it writes guest RAM behind the core's back.

mod bytecode;
mod cache;
mod compiler;
mod engine;
mod event;
mod jit;
mod segmem;

pub use cache::MemArea;
pub use event::{vector, Event, ExcCode, Exception, FarKind};
pub use jit::{Bus, CompileError, Jit, JitConfig, StepOutcome};
