pub mod ledger;
pub mod metrics;
pub mod notifications;
pub mod orchestrator;
pub mod paypal;
pub mod planner;
pub mod vault;

pub use ledger::{InMemoryLedgerStore, LedgerStore, MongoLedgerStore};
pub use notifications::Notifier;
pub use orchestrator::{ChargeMode, ChargeOrchestrator, CheckoutArgs, LinkPayArgs};
pub use paypal::{PaymentGateway, PaypalClient};
pub use vault::VaultManager;
