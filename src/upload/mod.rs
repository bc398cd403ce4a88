pub mod api_client;
pub mod batcher;
pub mod connectivity;
pub mod radio;
pub mod runner;
pub mod transport;

pub use api_client::{ApiCredentials, HttpApiClient, RemoteApi};
pub use batcher::{build_batches, EventGroup};
pub use connectivity::{
    CommandModem, ConnectionRequester, ConnectivityProbe, RetryPolicy, SystemProbe,
};
pub use radio::{HttpRadioLink, RadioLink};
pub use runner::{CycleReport, Transports, Triggers, UploadError, UploadRunner, UploadSettings};
pub use transport::{
    ApiTransport, LongRangeSettings, LongRangeTransport, Transport, TransportError, TransportKind,
};
