use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "talliffy", version, about = "Tally to backend sync daemon")]
pub struct Cli {
    #[command(flatten)]
    pub connector: ConnectorArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// How to invoke the external connector program.
#[derive(Debug, Clone, Args)]
pub struct ConnectorArgs {
    /// Interpreter or binary that runs the connector.
    #[arg(long, env = "TALLIFFY_CONNECTOR_PROGRAM", default_value = "python", global = true)]
    pub connector_program: String,

    /// Script (or leading argument) for incremental entity syncs.
    #[arg(long, env = "TALLIFFY_SYNC_SCRIPT", default_value = "incremental_sync.py", global = true)]
    pub sync_script: String,

    /// Script (or leading argument) for reading the Tally license number.
    #[arg(long, env = "TALLIFFY_LICENSE_SCRIPT", default_value = "tally_license.py", global = true)]
    pub license_script: String,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduled sync daemon (default if no subcommand given).
    Run {
        /// Run a single cycle now, wait for its reconciliation pass, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Run the full entity sequence for one company, or for every company with `--all`.
    SyncCompany {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        company_id: Option<i64>,

        #[arg(long)]
        all: bool,
    },

    /// Ask the backend to reconcile one company.
    Reconcile {
        company_id: i64,

        /// Entity kind (e.g. `ledgers`, `stock-item`); every entity when omitted.
        #[arg(long)]
        entity: Option<String>,
    },

    /// Print the effective configuration and probe the Tally port.
    ShowConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["talliffy", "sync-company", "42"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::SyncCompany {
                company_id: Some(42),
                all: false
            })
        ));

        let cli = Cli::try_parse_from(["talliffy", "sync-company", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::SyncCompany {
                company_id: None,
                all: true
            })
        ));

        assert!(Cli::try_parse_from(["talliffy", "sync-company"]).is_err());

        let cli = Cli::try_parse_from([
            "talliffy",
            "reconcile",
            "7",
            "--entity",
            "ledgers",
            "--connector-program",
            "python3",
        ])
        .unwrap();
        assert_eq!(cli.connector.connector_program, "python3");
        match cli.command {
            Some(Commands::Reconcile { company_id, entity }) => {
                assert_eq!(company_id, 7);
                assert_eq!(entity.as_deref(), Some("ledgers"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_is_allowed() {
        let cli = Cli::try_parse_from(["talliffy"]).unwrap();
        assert!(cli.command.is_none());
    }
}
