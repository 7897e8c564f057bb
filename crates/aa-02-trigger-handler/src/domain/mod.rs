//! # Domain Layer (Inner Hexagon)
//!
//! Pure response composition: message parsing, coin selection, unit
//! assembly and the balance/storage bookkeeping around it. No I/O.

pub mod accounting;
pub mod coin_selection;
pub mod composer;

pub use coin_selection::{select_coins, CoinSelection, Issuance};
pub use composer::{
    compose_unit, parse_messages, verify_unit, ComposedUnit, CompositionError, Funds, ParsedMessages,
    PaymentRequest, RequestedOutput, ResponseMessage, UnitHeader,
};
