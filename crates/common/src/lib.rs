pub mod callback;
pub mod clock;
pub mod error;
pub mod models;
pub mod store;

pub use callback::{CallbackEvent, PaymentCallback};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use models::{
    CreateTransactionRequest, CreateTransactionResponse, HealthResponse, SubTransaction,
    TokenPair, TransactionStatus,
};
pub use store::{CredentialStore, Credentials, FileStore, MemoryStore, RateTier};
