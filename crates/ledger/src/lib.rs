//! Stock ledger module (append-only movement chain).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod chain;
pub mod entry;

pub use chain::{next_entry, replay_balance, verify_chain, ExpectedHead, HeadState};
pub use entry::{EntryReference, LedgerAction, LedgerEntry, NewEntry};
