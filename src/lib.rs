//! Payme and Click payment-gateway handling plus phone OTP verification for
//! a Medusa-style storefront.

pub mod api;
pub mod cache;
pub mod commerce;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod otp;
pub mod payments;
pub mod workers;
