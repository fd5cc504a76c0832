//! ProActive node: active objects, their bodies, and the plumbing between them.
//!
//! An active object is served by a [`body::BodyHandle`] that owns a request
//! queue, a table of pending [`future::ReplyFuture`]s, and the body's
//! location. Callers talk to it through a [`proxy::Proxy`]; every call
//! returns a future immediately and the reply settles it later.
//!
//! ## Modules
//!
//! - `body`: body lifecycle, serving loop and the capabilities peers use
//! - `proxy`: caller-side stubs, location retry and session setup
//! - `future`: write-once reply futures and the per-body future table
//! - `registry`: where each body currently lives
//! - `transport`: how bodies reach nodes (in-process by default)
//! - `ft`: ordered delivery of fault-tolerance protocol messages
//! - `nfe`: non-functional exception broadcast

pub mod body;
pub mod config;
pub mod error;
pub mod ft;
pub mod future;
pub mod immediate;
pub mod message;
pub mod nfe;
pub mod node;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod runtime;
pub mod transport;
pub mod tree;

pub use body::{ActiveObject, BodyContext, BodyHandle, BodyOptions, BodyState, Call, Outcome};
pub use config::Config;
pub use error::{BodyError, CommunicationFailure, ErrorKind, RemoteFault, ServiceError};
pub use future::{FutureState, ReplyFuture};
pub use message::{Acceptance, MethodSignature, TypeTag};
pub use proxy::Proxy;
pub use runtime::{Environment, ProActiveRuntime};
