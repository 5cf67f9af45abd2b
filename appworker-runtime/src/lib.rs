//! Worker side of the app-worker pipe protocol
//!
//! An app worker binary implements [`WorkerHandler`] and hands it to
//! [`WorkerRuntime::run`]:
//!
//! ```no_run
//! use appworker_runtime::{HandlerResponse, RequestContext, Thrown, WorkerHandler, WorkerRuntime};
//! use appworker_ipc::SerializableRequest;
//! use std::sync::Arc;
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl WorkerHandler for Hello {
//!     async fn handle_request(
//!         &self,
//!         _context: RequestContext,
//!         _request: SerializableRequest,
//!     ) -> Result<HandlerResponse, Thrown> {
//!         Ok(HandlerResponse::text(200, "hello"))
//!     }
//! }
//!
//! # async fn run() -> Result<(), appworker_runtime::RuntimeError> {
//! WorkerRuntime::from_args()?.run(Arc::new(Hello)).await
//! # }
//! ```

pub mod error;
pub mod handler;
pub mod runtime;

pub use error::RuntimeError;
pub use handler::{HandlerResponse, RequestContext, ResponseBody, Thrown, WorkerHandler, WorkerOutput};
pub use runtime::WorkerRuntime;
