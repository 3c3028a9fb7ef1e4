//! OTP delivery seam. SMS gateways plug in behind [`OtpSender`].

use async_trait::async_trait;
use tracing::info;

use super::phone::{OtpPurpose, PhoneNumber};
use crate::error::{AppError, AppErrorKind, ExternalError};
use crate::logging::mask_phone;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery rejected: {0}")]
    Rejected(String),

    #[error("delivery channel unavailable: {0}")]
    Unavailable(String),
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        AppError::new(AppErrorKind::External(ExternalError::Delivery {
            message: err.to_string(),
        }))
    }
}

#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(
        &self,
        phone: &PhoneNumber,
        purpose: &OtpPurpose,
        code: &str,
    ) -> Result<(), DeliveryError>;
}

/// Development sender: records that a code went out without the code itself.
#[derive(Debug, Default, Clone)]
pub struct LogOnlySender;

#[async_trait]
impl OtpSender for LogOnlySender {
    async fn send(
        &self,
        phone: &PhoneNumber,
        purpose: &OtpPurpose,
        _code: &str,
    ) -> Result<(), DeliveryError> {
        info!(
            phone = %mask_phone(phone.as_str()),
            purpose = %purpose,
            "OTP dispatched (log-only sender)"
        );
        Ok(())
    }
}
