//! Client-side sync core: a paginated collection controller and a realtime
//! channel controller, plus the IO seams they run on.

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

pub mod channel;
pub mod collection;
pub mod config;
pub mod credentials;
pub mod fence;
pub mod http;
pub mod ledger;
pub mod query;
pub mod supervisor;
pub mod transport;

pub use channel::{ChannelConfig, ChannelEvent, MessageApi, RealtimeChannel};
pub use collection::{
    CollectionConfig, CollectionController, CollectionEndpoint, CollectionEvent, CollectionPage,
    CollectionSnapshot, CollectionSource,
};
pub use config::{load_settings, SyncSettings};
pub use credentials::{CredentialProvider, NoCredentials, SharedToken, StaticToken};
pub use fence::{FenceToken, FetchOutcome, RequestFence};
pub use http::{HttpCollectionEndpoint, HttpMessageApi};
pub use ledger::{Ingested, MessageLedger};
pub use query::{CollectionQuery, ParamBuilder, Row};
pub use supervisor::{ReconnectSupervisor, RetryState, Transition};
pub use transport::{ChannelTransport, TransportConnection, WebSocketTransport};

/// Turns an event subscription into a stream. A subscriber that falls behind
/// skips the events it missed instead of ending the stream.
pub fn event_stream<E>(receiver: broadcast::Receiver<E>) -> impl Stream<Item = E>
where
    E: Clone + Send + 'static,
{
    BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
                None
            }
        }
    })
}
