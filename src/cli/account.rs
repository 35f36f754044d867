use anyhow::{Result, anyhow};
use clap::Subcommand;
use std::io::{self, Write};

use crate::calendar::db::upsert_account;
use crate::core::AppConfig;
use crate::google::oauth::{authorization_url, exchange_code_for_token};

#[derive(Subcommand)]
pub enum AccountCommand {
    /// Connect an account. Without `--refresh-token` this walks through the
    /// OAuth consent flow.
    Add {
        /// Provider account id, usually the email address
        #[arg(long)]
        id: String,
        /// The person owning the account. Calendars with the same owner
        /// block each other.
        #[arg(long)]
        owner: String,
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Refresh the calendars known for an account and start watching them
    Discover {
        #[arg(long)]
        id: String,
    },
}

fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_owned())
}

async fn authorize(config: &AppConfig) -> Result<String> {
    if config.google_client_id.is_empty() || config.google_client_secret.is_empty() {
        return Err(anyhow!(
            "Set BUSYSYNC_GOOGLE_CLIENT_ID and BUSYSYNC_GOOGLE_CLIENT_SECRET in your environment"
        ));
    }
    let redirect_uri = std::env::var("BUSYSYNC_GOOGLE_REDIRECT_URI")
        .unwrap_or_else(|_| "urn:ietf:wg:oauth:2.0:oob".to_string());
    println!(
        "\nPlease open the following URL in your browser and authorize access:\n\n{}\n",
        authorization_url(&config.google_client_id, &redirect_uri)
    );
    let code = prompt("Paste the authorization code shown by Google here: ")?;

    let token = exchange_code_for_token(
        &reqwest::Client::new(),
        &config.google_oauth_url,
        &config.google_client_id,
        &config.google_client_secret,
        &code,
        &redirect_uri,
    )
    .await?;
    token
        .refresh_token
        .ok_or(anyhow!("No refresh token in response"))
}

pub async fn run(command: AccountCommand, config: AppConfig) -> Result<()> {
    match command {
        AccountCommand::Add {
            id,
            owner,
            refresh_token,
        } => {
            let refresh_token = match refresh_token {
                Some(token) => token,
                None => authorize(&config).await?,
            };
            let service = super::open_service(config).await?;
            upsert_account(&service.db, &id, &owner, Some(refresh_token)).await?;
            println!("Refresh token for {} saved to DB.", id);

            let calendars = service.discover_calendars(&id).await?;
            println!("Found {} writable calendars for {}", calendars.len(), id);
        }
        AccountCommand::Discover { id } => {
            let service = super::open_service(config).await?;
            let calendars = service.discover_calendars(&id).await?;
            for calendar in &calendars {
                println!("{}\t{}\t{}", calendar.id, calendar.provider_calendar_id, calendar.name);
            }
            let summary = service.renew_expiring_subscriptions().await?;
            println!("Subscriptions: {:?}", summary);
        }
    }
    Ok(())
}
