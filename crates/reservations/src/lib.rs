//! Reservation module (time-limited stock holds).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod policy;
pub mod reservation;

pub use policy::HoldPolicy;
pub use reservation::{ItemChange, Reservation, ReservationItem, ReservationStatus};
