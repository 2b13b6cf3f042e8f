//! # burpui
//!
//! The `burpui` crate is an interactive HTTP/HTTPS intercepting proxy
//! engine: it accepts client connections, forwards or pauses requests for
//! an operator decision, optionally terminates TLS with certificates
//! issued by a local CA, and publishes immutable snapshots of every flow
//! on a bounded channel.
//!
//! # Features
//!
//! - Transparent HTTP forwarding and opaque `CONNECT` tunneling
//! - HTTPS interception with on-the-fly leaf certificate issuance
//! - Pause, edit (as raw wire text), forward or drop individual requests
//! - Breakpoint rules that force interception of matching flows
//! - A repeater that replays raw requests through the shared client
//!
//! # Example
//!
//! ```no_run
//! use burpui::{Config, Decision, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let (server, mut snapshots) = ProxyServer::builder()
//!     .config(Config {
//!       listen_addr: "127.0.0.1:8080".into(),
//!       ..Config::default()
//!     })
//!     .build()
//!     .await?;
//!
//!   let controller = server.controller();
//!   controller.set_intercept(true);
//!
//!   // the operator surface: forward every paused flow
//!   tokio::spawn(async move {
//!     while let Some(snapshot) = snapshots.recv().await {
//!       if snapshot.intercepted && snapshot.pending {
//!         snapshot.handle().send_decision(Decision::Forward);
//!       }
//!     }
//!   });
//!
//!   let (_shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
//!   server.serve(shutdown_rx).await?;
//!   Ok(())
//! }
//! ```

pub mod ca;
mod client;
mod connector;
mod controller;
mod errors;
mod flow;
mod httpraw;
mod limit;
mod proxy;
mod repeater;
mod request;
mod response;
mod socket;

pub use client::{Client, ClientBuilder};
pub use controller::{BreakpointRule, Controller};
pub use errors::{Error, Result};
pub use flow::{Decision, FlowHandle, FlowSnapshot};
pub use httpraw::{parse_request, render_raw_request};
pub use limit::LimitBuffer;
pub use proxy::{Config, ProxyServer, ProxyServerBuilder};
pub use repeater::Repeater;
pub use request::Request;
pub use response::Response;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
