//! Pricing and risk: quote generation, adverse-selection monitoring,
//! and the event-loop engine that ties them together.

pub mod adverse;
pub mod engine;
pub mod maker;
