//! Guest exceptions and the events the engine hands to the host.

/// Exception vectors raised by this engine.
pub mod vector {
    pub const DE: u8 = 0;
    pub const DB: u8 = 1;
    pub const BP: u8 = 3;
    pub const OF: u8 = 4;
    pub const BR: u8 = 5;
    pub const UD: u8 = 6;
    pub const NM: u8 = 7;
    pub const TS: u8 = 10;
    pub const NP: u8 = 11;
    pub const SS: u8 = 12;
    pub const GP: u8 = 13;
    pub const PF: u8 = 14;
    pub const AC: u8 = 17;
}

/// Extra word pushed with (or attached to) an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcCode {
    /// A plain error code (#GP(0), #PF error code, #AC).
    Err(u16),
    /// A selector-shaped error code naming the offending descriptor.
    Sel(u16),
}

impl ExcCode {
    #[inline]
    pub fn value(self) -> u16 {
        match self {
            ExcCode::Err(v) | ExcCode::Sel(v) => v,
        }
    }
}

/// A guest-triggerable fault.
///
/// Exceptions are ordinary values inside the engine: every fallible
/// operation returns `Result<_, Exception>` and the first error aborts the
/// rest of the instruction. At the step boundary the survivor lands in the
/// single pending slot and is delivered before the next fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub vector: u8,
    pub code: Option<ExcCode>,
}

impl Exception {
    #[inline]
    pub fn new(vector: u8) -> Exception {
        Exception { vector, code: None }
    }

    #[inline]
    pub fn with_code(vector: u8, code: u16) -> Exception {
        Exception {
            vector,
            code: Some(ExcCode::Err(code)),
        }
    }

    #[inline]
    pub fn with_selector(vector: u8, sel: u16) -> Exception {
        Exception {
            vector,
            code: Some(ExcCode::Sel(sel)),
        }
    }

    /// #GP(0), the workhorse.
    #[inline]
    pub fn gp0() -> Exception {
        Exception::with_code(vector::GP, 0)
    }

    #[inline]
    pub fn ud() -> Exception {
        Exception::new(vector::UD)
    }
}

/// What kind of control transfer an [`Event`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarKind {
    Jmp,
    Call,
}

/// An event the engine asks the host's delivery plumbing to vector.
///
/// In real mode the engine vectors through the IVT itself; everything the
/// protected-mode descriptor machinery owns (IDT gates, call gates, task
/// switches) goes through [`crate::Bus::deliver_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// External interrupt, vector already acknowledged.
    Interrupt { vector: u8 },
    /// A pending guest exception.
    Exception { vector: u8, code: Option<ExcCode> },
    /// INT n / INT3 / INTO.
    SoftInt { vector: u8 },
    /// Far JMP/CALL landing on a gate or task descriptor.
    FarGate {
        kind: FarKind,
        selector: u16,
        offset: u32,
    },
}
