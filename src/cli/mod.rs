use crate::app;
use crate::credentials::{Credential, Provider, SqliteCredentialStore};
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "crmlink")]
#[command(about = "Turn meeting transcripts into reviewed CRM contact updates", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the API service (default)
    Serve,
    /// Refresh credentials that are about to expire, once
    Refresh,
    /// Manage stored CRM credentials
    Credential(CredentialCliArgs),
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct CredentialCliArgs {
    #[command(subcommand)]
    pub command: CredentialCommand,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommand {
    /// Store or replace a user's token set for a provider
    Add {
        /// User the credential belongs to
        #[arg(long)]
        user: String,
        /// hubspot or salesforce
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Seconds until the access token expires
        #[arg(long, default_value = "1800")]
        expires_in: i64,
        /// Provider account reference (portal or org id)
        #[arg(long, default_value = "")]
        account: String,
        /// Salesforce instance URL
        #[arg(long)]
        instance_url: Option<String>,
    },
    /// List stored credentials
    List,
}

pub async fn handle_refresh_command() -> Result<()> {
    let report = app::run_refresh_once().await?;
    if report.total() == 0 {
        println!("No credentials are due for refresh.");
        return Ok(());
    }
    println!(
        "Refreshed {}, failed {}, timed out {}",
        report.refreshed, report.failed, report.timed_out
    );
    if report.failed + report.timed_out > 0 {
        return Err(anyhow!(
            "{} credential(s) could not be refreshed",
            report.failed + report.timed_out
        ));
    }
    Ok(())
}

pub fn handle_credential_command(args: CredentialCliArgs) -> Result<()> {
    let store = SqliteCredentialStore::open_default()?;

    match args.command {
        CredentialCommand::Add {
            user,
            provider,
            access_token,
            refresh_token,
            expires_in,
            account,
            instance_url,
        } => {
            if user.trim().is_empty() {
                return Err(anyhow!("--user must not be empty"));
            }
            let id = store.upsert(&Credential {
                id: 0,
                user_id: user.clone(),
                provider,
                access_token,
                refresh_token,
                expires_at: Utc::now() + Duration::seconds(expires_in.max(0)),
                external_account: account,
                instance_url,
            })?;
            println!(
                "Stored {} credential #{} for {}",
                provider.display_name(),
                id,
                user
            );
        }
        CredentialCommand::List => {
            let credentials = store.list()?;
            if credentials.is_empty() {
                println!("No credentials stored.");
                return Ok(());
            }

            println!("Found {} credential(s):\n", credentials.len());
            for credential in credentials {
                println!("ID: {}", credential.id);
                println!("User: {}", credential.user_id);
                println!("Provider: {}", credential.provider.display_name());
                println!("Account: {}", credential.external_account);
                println!("Expires: {}", credential.expires_at.to_rfc3339());
                println!(
                    "Refresh token: {}",
                    if credential.refresh_token.is_some() { "yes" } else { "no" }
                );
                println!("---");
            }
        }
    }

    Ok(())
}
