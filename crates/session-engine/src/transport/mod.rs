//! Real-time transport integration: the session wrapper, the transport
//! collaborator trait, and credential token renewal.

mod session;
mod token;

pub use session::{ConnectionState, Transport, TransportEvent, TransportSession};
pub use token::{
    spawn_renewal_task, CredentialToken, HttpTokenFetcher, RenewalCommand, TokenFetcher,
};
