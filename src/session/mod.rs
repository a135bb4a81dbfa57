//! Session state machine.
//!
//! [`SessionCore`] holds the connection state and is only ever mutated
//! behind one mutex; [`VoiceSession`] drives it from the async world and
//! [`SessionRegistry`] keeps at most one live session per process.

mod client;
mod machine;
mod microphone;
mod registry;
mod state;

pub use client::{SessionDeps, VoiceSession};
pub use machine::{SessionCore, SessionSnapshot};
pub use microphone::{ConfiguredMicrophone, Microphone};
pub use registry::SessionRegistry;
pub use state::{ConnectionState, SessionEvent};
