use core::fmt;

/// Error codes surfaced at the object API.
///
/// Every core operation reports its outcome through one of these; the
/// caller's next action is determined solely by the code. `None` is the
/// success code on the wire and never travels inside an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum Errno {
    /// Success.
    None = 0,
    /// Allocation failed at a block, node, atom or frame boundary.
    NoMemory = 1,
    /// The operation exists but is not wired up yet; final for callers.
    NotImplemented = 2,
    /// Another transaction holds this operation's lock; retry after it
    /// commits or rolls back.
    TxnLockedOperation = 3,
    /// The container has nothing left to take.
    DataNoItems = 4,
    /// Compare-and-swap expectation mismatch; no state changed.
    DataCas = 5,
    /// Division or modulo by zero.
    NumberDivmodByZero = 6,
    /// No object answers to this id or label.
    ObjectNotFound = 7,
    /// The label is already bound to an object.
    ObjectExists = 8,
    /// The object's type does not support this operation.
    WrongObjectType = 9,
    /// No such transaction, or it already completed.
    TxnNotFound = 10,
}

impl Errno {
    /// Wire code of this errno.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        use Errno::*;
        Some(match code {
            0 => None,
            1 => NoMemory,
            2 => NotImplemented,
            3 => TxnLockedOperation,
            4 => DataNoItems,
            5 => DataCas,
            6 => NumberDivmodByZero,
            7 => ObjectNotFound,
            8 => ObjectExists,
            9 => WrongObjectType,
            10 => TxnNotFound,
            _ => return Option::None,
        })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Errno {}
