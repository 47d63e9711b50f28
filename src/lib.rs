//! PolySniper Library
//!
//! Position lifecycle engine for short-lived binary-outcome markets:
//! taking, tracking, exiting, and settling time-boxed positions, with
//! crash recovery and a pluggable entry signal per strategy.
//!
//! Known limitation: concurrent strategies share one funded account with
//! no balance reservation step; two instances can jointly overdraw it.

pub mod clob;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod position;
pub mod reconcile;
pub mod sizing;
pub mod strategy;
pub mod types;
