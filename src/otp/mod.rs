//! Phone one-time passwords over a shared key-value store.

pub mod memory;
pub mod phone;
#[cfg(feature = "cache")]
pub mod redis_store;
pub mod sender;
pub mod service;
pub mod store;

pub use memory::MemoryOtpStore;
pub use phone::{normalize_phone, OtpPurpose, PhoneNumber};
#[cfg(feature = "cache")]
pub use redis_store::RedisOtpStore;
pub use sender::{DeliveryError, LogOnlySender, OtpSender};
pub use service::{IssuedOtp, OtpConfig, OtpService};
pub use store::{CodeCheck, CodeWrite, OtpStore, VerifyOutcome};
