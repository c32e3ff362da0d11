//! Hypebot Scheduler
//!
//! The two background loops: the idle sweep that breaks chat silence,
//! and the slot dispatcher that delivers fixed-time broadcasts to
//! opted-in chats.

pub mod idle;
pub mod slots;

pub use idle::IdleSweeper;
pub use slots::SlotDispatcher;
