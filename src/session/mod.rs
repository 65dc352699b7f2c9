pub mod model;
pub mod store;

pub use model::*;
pub use store::{AuthOutcome, CreateSessionConfig, InjectOutcome, SessionHandle, SessionStore, SignatureOutcome};
