//! Storage and coordination for the stock engine.
//!
//! This crate holds the store traits (ledger chains, reservation rows, carts,
//! catalog snapshots, coupon rules), their in-memory implementations, and the
//! three components built on top of them: the reservation manager, the cart
//! aggregator, and the expiry sweeper. Stores are synchronous and internally
//! locked so the components stay runtime-agnostic.

pub mod cart_service;
pub mod cart_store;
pub mod catalog;
pub mod coupons;
pub mod ledger_store;
pub mod manager;
pub mod reservation_store;
pub mod sweeper;

mod integration_tests;

pub use cart_service::{CartAggregator, CartView, CheckoutOutcome, MergeOutcome};
pub use cart_store::{CartStore, InMemoryCartStore};
pub use catalog::{Catalog, InMemoryCatalog, ProductSnapshot};
pub use coupons::{CouponDirectory, CouponRule, InMemoryCouponDirectory};
pub use ledger_store::{ChainKey, ConditionalAppend, InMemoryLedgerStore, LedgerStore};
pub use manager::{
    ConvertOutcome, ManagerConfig, ReleaseOutcome, ReservationManager, ReserveRequest,
    StockAvailability,
};
pub use reservation_store::{InMemoryReservationStore, ReservationStore};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperConfig, SweeperHandle, SweeperStats};
