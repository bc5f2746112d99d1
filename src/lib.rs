//! conduit_http - HTTP/1.x server connector for synchronous request handlers
//!
//! The connector owns everything between the TCP socket and an application
//! [`Handler`]: it accepts connections, frames requests, hands each one to
//! the handler on the blocking pool and writes the response back, honoring
//! keep-alive, pipelining order and per-connection flow control.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining and chunked responses
//! - **HTTP/1.0**: opt-in keep-alive and close-delimited streamed bodies
//!
//! # Request adaptation
//!
//! [`Request`] exposes the raw head as a [`HeaderSet`] and derives typed
//! facets from it on first access: client info, conditions, cookies, ranges,
//! credentials, caching directives and more. Each facet is parsed at most
//! once and can be overridden by the handler before it is read.
//!
//! # Response writing
//!
//! [`Response`] carries a status, extra headers and an optional [`Entity`].
//! The writer decides which entity headers and whether a body may be sent
//! from the method and status, so a `HEAD` or `304` never leaks a payload.
//! Bodies can be bytes, a channel-fed stream or a template rendered at
//! write time.
//!
//! # Examples
//!
//! ```no_run
//! use conduit_http::{Context, HandlerError, Request, Response, Server, StatusCode};
//!
//! fn hello(_: &mut Context, req: &mut Request) -> Result<Response, HandlerError> {
//!     let agent = req.client_info().agent.clone().unwrap_or_default();
//!     Ok(Response::new(StatusCode::Ok).body(format!("Hello, {agent}!")))
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .bind("127.0.0.1:8080")
//!         .unwrap()
//!         .handler(hello)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! Deferring the response to another thread:
//! ```no_run
//! use conduit_http::{Context, HandlerError, Request, Response, StatusCode};
//!
//! fn slow(_: &mut Context, _: &mut Request) -> Result<Response, HandlerError> {
//!     let (response, commit) = Response::defer();
//!
//!     std::thread::spawn(move || {
//!         commit.commit(Response::new(StatusCode::Ok).body("done"));
//!     });
//!     Ok(response)
//! }
//! ```

pub(crate) mod http {
    pub mod header;
    pub(crate) mod parser;
    pub(crate) mod request;
    pub(crate) mod response;
    pub mod template;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
    pub(crate) mod writer;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, HandlerError},
    http::{
        header,
        header::Tag,
        request::{ClientInfo, Conditions, ConnectionInfo, Facet, FacetState, Request, RequestEntity},
        response::{Body, Commit, Entity, Response, SendOutcome},
        template,
        types::{Header, HeaderSet, Method, Protocol, StatusCode, Version},
    },
    server::{
        connection::{Context, Handler},
        server_impl::{RunningServer, Server, ServerBuilder},
    },
};
