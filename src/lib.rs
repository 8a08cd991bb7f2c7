//! portfwd - multi-mapping TCP port forwarder.
//!
//! Each configured mapping gets a listener on its local address; every accepted
//! connection is paired with a freshly dialed connection to the mapping's
//! remote address and bytes are relayed both ways. An HTTP endpoint inspects
//! and replaces the mapping set at runtime and triggers a graceful shutdown.

pub mod admin;
pub mod buffer;
pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod pair;
pub mod relay;
pub mod server;
pub mod supervisor;

pub use buffer::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE};
pub use cli::{BuildInfo, CheckArgs, Cli, Command, ServeArgs};
pub use config::{
    validate_mappings, ConfigDocument, ConfigFormat, ConfigSnapshot, FileStore, Mapping,
    MappingStore,
};
pub use error::{is_closed_error, Error, ExitCode, Result};
pub use forwarder::{spawn_forwarder, ForwarderContext, ForwarderHandle, ForwarderState};
pub use pair::{pair, splice, PairContext, PairStats};
pub use relay::{relay, RelayOutcome};
pub use server::{run_check, run_server};
pub use supervisor::{ApplyReport, ForwarderStatus, Supervisor, SupervisorOptions};
