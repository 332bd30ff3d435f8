//! Outbound transfer of artifacts to the collection server.
//!
//! - `transport`: the seam between an item and the wire (`UploadTransport`)
//! - `http`: multipart HTTP implementation of that seam
//! - `item`: per-artifact state machine with exactly-once terminal notices
//! - `queue`: owner of many items, limiting how many transfer concurrently
//!
//! Transfers run on their own threads and report back through a sink; the
//! owner feeds those events into the item on its own thread, so item state is
//! only ever touched from one place.

mod http;
pub(crate) mod item;
mod queue;
mod transport;

pub use http::{HttpTransport, HttpTransportFactory};
pub use item::{ItemNotice, UploadItem, UploadStatus};
pub use queue::{EventDispatch, QueueNotice, QueueSummary, UploadQueue};
pub use transport::{TransferError, TransferEvent, TransferSink, TransportFactory, UploadTransport};
