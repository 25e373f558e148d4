//! Source-system connectors implementing `talliffy_core::SourceConnector`.

pub mod tally_process;

pub use tally_process::{
    CmdOutput, CommandRunner, ProcessConnector, ProcessConnectorConfig, TokioCommandRunner,
    probe_tally,
};
