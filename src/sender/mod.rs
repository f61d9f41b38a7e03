pub mod http;
pub mod serialization;
pub mod transport;
pub mod worker;

pub use http::{HttpTransport, HttpTransportConfig, HttpTransportError};
pub use serialization::SerializationError;
pub use transport::{
    BatchOutcome, BatchReport, DeliveryError, Outcome, StaticTokenProvider, TokenError,
    TokenProvider, Transport,
};
pub use worker::{InFlight, SenderPool, SenderWorker, WorkerContext, WorkerSettings};
