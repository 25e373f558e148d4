use clap::Parser;
use talliffy_server::app::App;
use talliffy_server::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    talliffy_core::o11y::init_tracing()?;
    let cli = Cli::parse();
    let app = App::from_env(&cli.connector)?;

    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => app.run(once).await?,
        Commands::SyncCompany { company_id, .. } => app.sync_company(company_id).await?,
        Commands::Reconcile { company_id, entity } => {
            app.reconcile(company_id, entity.as_deref()).await?
        }
        Commands::ShowConfig => app.show_config().await?,
    }
    Ok(())
}
