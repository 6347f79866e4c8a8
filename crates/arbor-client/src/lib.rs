//! Client side of arbor: build a command, submit it, collect its output.
//!
//! ```ignore
//! use arbor_client::{IpcClient, RequestBuilder};
//!
//! let client = IpcClient::new(control_endpoint, relay_bind);
//! let req = RequestBuilder::new(vec!["hostname".into()]).nodes("1-4").build().await?;
//! let outcome = client.exec(req, arbor_kernel::shared_sink(tokio::io::stdout())).await?;
//! ```

mod ipc;
mod request;
mod traits;

pub use ipc::{ExecOutcome, IpcClient};
pub use request::RequestBuilder;
pub use traits::{ClientError, ClientResult, TreeClient};
