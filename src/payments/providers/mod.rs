pub mod click;
pub mod payme;

pub use click::{ClickConfig, ClickHandler, ClickOfdClient, FiscalSubmitter};
pub use payme::{PaymeConfig, PaymeHandler};
