//! Task dispatcher: future-based RPC over isolated worker contexts.
pub mod channel;
#[allow(clippy::module_inception)]
pub mod dispatcher;
pub mod message;
pub mod remote;
pub mod state;

pub use channel::{InProcessSpawner, WorkerEntry, WorkerLink, WorkerPort, WorkerSpawner, link_pair};
pub use dispatcher::{TaskDispatcher, WorkerNotification};
pub use message::{Lifecycle, TaskId, WorkerRequest, WorkerResponse};
pub use remote::RemoteExchangeApi;
pub use state::WorkerState;
