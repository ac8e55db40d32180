use std::fmt::Debug;
use std::future::Future;

use tokio::runtime::Handle;
use tracing::trace;

/// Drives `future` to completion on the calling thread with the current tokio
/// runtime entered, so runtime-bound I/O inside it keeps working.
///
/// Meant for the kernel callback threads, which are not runtime workers. Calling it
/// from inside an async task blocks that worker until the future is done.
pub fn run_async_blocking<F>(future: F) -> F::Output
where
    F: Future,
    F::Output: Debug,
{
    let handle = Handle::current();
    let _guard = handle.enter();
    let output = futures::executor::block_on(future);
    trace!("blocking call finished with {:?}", output);
    output
}
