//! Payment-gateway protocol handling for Payme and Click, and the helpers
//! both share: amounts, signatures, session data views, fiscal receipts,
//! per-session locking and order completion.

pub mod amount;
pub mod clock;
pub mod completion;
pub mod error;
pub mod fiscal;
pub mod locks;
pub mod providers;
pub mod types;
pub mod utils;

pub use completion::{OrderCompleter, ReconcileReport};
pub use error::{PaymentError, PaymentResult};
pub use locks::SessionLocks;
pub use providers::{ClickHandler, PaymeHandler};
pub use types::{Gateway, PaymentSession};
