//! Client core for the Oblivion ad-gated key portal.
//!
//! A visitor is identified by a session identifier (SID) kept in a durable
//! [`session::SessionStore`]. The [`acquisition::KeyAcquisitionController`]
//! asks the KeyService for a key, leaves for the ad gate when the service
//! refuses, and polls after the visitor returns until a key is issued.

pub mod acquisition;
pub mod config;
pub mod protocol;
pub mod redirect;
pub mod session;
pub mod store;

pub use acquisition::{
    AcquisitionAttempt, AcquisitionConfig, AcquisitionError, AttemptResult, AttemptStatus,
    IssuedKey, KeyAcquisitionController, KeyCheck,
};
pub use config::{GateSignal, PortalConfig};
pub use protocol::{KeyServiceTransport, ServiceReply};
pub use redirect::{AdRedirect, Departure, Navigator, build_ad_redirect, parse_return_sid};
pub use session::{SessionError, SessionIdentity, SessionStore, Sid, SidSource};
pub use store::{FileSessionStore, MemorySessionStore, StoreError};
