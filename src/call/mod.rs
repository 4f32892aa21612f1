//! Call Module - Anruf-Lebenszyklus
//!
//! - `machine`: reine Zustandslogik eines Anrufs (Befehle, Eingaben, Effekte)
//! - `manager`: Event-Loop, die Effekte gegen Signaling und Media ausführt
//! - `candidates`: Puffer für ICE Candidates in beide Richtungen

mod alert;
mod candidates;
mod error;
mod machine;
mod manager;
mod state;

pub use alert::{IncomingCallAlert, LogAlert};
pub use candidates::CandidateBuffer;
pub use error::CallError;
pub use machine::{CallInput, CallStateMachine, Command, Effect, SessionPolicy, Timer};
pub use manager::CallManager;
pub use state::{CallRole, CallSnapshot, CallState, MediaControls};
