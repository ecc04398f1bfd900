//! `qcomtee`: a userspace object-capability IPC runtime mediating calls
//! between a host process and a Trusted Execution Environment across a
//! kernel driver.
//!
//! The core is an object graph of reference-counted [`Object`] handles
//! (Root, Remote, Callback), a per-Root [`Namespace`] scoping exported
//! Callback ids, bidirectional parameter marshaling, a forward-path
//! [`Invoker`], and a reverse-path Supplicant worker pool. Start with
//! [`Root::builder`].

#![warn(missing_docs)]

mod driver;
mod error;
mod invoker;
mod marshal;
mod namespace;
mod object;
pub mod objects;
mod param;
mod root;
mod supplicant;

pub use driver::unix::UnixDriver;
pub use driver::{SupplicantRequest, TeeDriver, WireParam};
pub use error::{QcomError, QcomResult};
pub use invoker::{InvokeOutcome, Invoker};
pub use object::{CallbackObject, Object};
pub use param::{Param, UBuf, DISPATCH_PARAMS_MAX, MAX_INVOKE_PARAMS};
pub use root::{Root, RootBuilder};

pub use driver::stub::{InvokeResponse, RecordedInvoke, RecordedSend, StubDriver};
