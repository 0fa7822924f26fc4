//! Domain Layer
//!
//! Pure types and algorithms with no I/O: the state machine engine, request
//! correlation and the instrument catalog types.

pub mod correlation;
pub mod fsm;
pub mod instrument;
