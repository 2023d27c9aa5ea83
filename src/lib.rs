//! Asynchronous LDAP v3 client (RFC 4511) for tokio.
//!
//! The client owns at most one transport (TCP, TLS or unix socket) and
//! multiplexes every operation over it by message id. While disconnected,
//! operations are parked in a bounded FIFO queue and flushed on connect;
//! an optional reconnect policy rebuilds the transport with exponential
//! backoff. Searches stream entries as they arrive, and a PagedResults
//! control is driven transparently across pages.
//!
//! ```no_run
//! use ldap_client::{ClientOptions, LdapClient, ReconnectOptions, SearchOptions, Scope};
//!
//! # async fn run() -> Result<(), ldap_client::LdapError> {
//! let client = LdapClient::new(
//!     ClientOptions::url("ldap://localhost:389")
//!         .with_timeout_ms(5_000)
//!         .with_reconnect(ReconnectOptions::default()),
//! )?;
//! client.bind("cn=admin,dc=example,dc=org", "secret").await?;
//!
//! let mut stream = client
//!     .search(
//!         SearchOptions::new("dc=example,dc=org")
//!             .scope(Scope::Subtree)
//!             .filter_str("(objectClass=person)")
//!             .attributes(["cn", "mail"]),
//!     )
//!     .await?;
//! while let Some(item) = stream.next().await {
//!     println!("{:?}", item?);
//! }
//! client.unbind().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod conn;
pub mod error;
pub mod filter;
pub mod framing;
mod pending;
pub mod protocol;
mod queue;
pub mod search;

pub use client::{setup_hook, ClientEvent, LdapClient, SetupConn, SetupHook, WHOAMI_OID};
pub use config::{ClientOptions, ReconnectOptions, TlsOptions};
pub use error::{LdapError, Result, ResultCode};
pub use filter::Filter;
pub use protocol::{
    Attribute, Change, Control, DerefAliases, LdapResult, Message, ModifyOp, ProtocolOp, Scope,
    SearchEntry, PAGED_RESULTS_OID,
};
pub use search::{SearchItem, SearchOptions, SearchStream};
