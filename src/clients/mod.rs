//! Adapters for the external services.
//!
//! Each adapter owns the wire protocol of one third party and translates
//! every failure into the [`crate::errors::SessionError`] taxonomy at this
//! boundary. Nothing above these modules ever sees a raw transport error.

pub mod microsoft;
pub mod untis;
