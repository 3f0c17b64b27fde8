//! REST route handlers for the non-forwarding API surface.

pub mod agents;
pub mod device;
pub mod health;
