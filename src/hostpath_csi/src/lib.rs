mod controller_server;
mod csi_types;
mod hostpath_client;
mod meta_store;
mod node_agent;
mod node_server;
mod sync_worker;

pub use controller_server::*;
pub use csi_types::*;
pub use hostpath_client::*;
pub use meta_store::*;
pub use node_agent::*;
pub use node_server::*;
pub use sync_worker::*;

use hostpath_lib::{HostPathError, HostPathResult};

/// Runs quota and filesystem work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(what: &str, f: F) -> HostPathResult<T>
where
    F: FnOnce() -> HostPathResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HostPathError::Internal(format!("{} join error: {}", what, e)))?
}
