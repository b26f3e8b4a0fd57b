#![cfg_attr(not(test), no_std)]

//! Battery management firmware core.
//!
//! Wires the pack model and algorithms from `bms-core` to the MAX17841
//! transport and MAX17823 chain driver, and runs the periodic control loop.
//! Peripheral bring-up, the CAN driver, and the e-paper rasterizer live with
//! the board integration; they plug in through the traits in [`inputs`],
//! [`charger`] and [`display`].

pub mod charger;
pub mod control;
pub mod display;
pub mod heartbeat;
pub mod inputs;

// The concrete drivers the board wires into [`control::Bms`].
pub use max17823::Max17823Chain;
pub use max17841::Max17841;
