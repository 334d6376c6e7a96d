use crate::{cli::commands::auth::{LoginOptions, LogoutOptions}, keystore::Keystore, reputation};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::io::{self, BufRead, Write};
use tracing::info;

pub async fn login_subcommand(opts: &LoginOptions) -> Result<()> {
    let token = match &opts.token {
        Some(token) => token.clone(),
        None => read_token_from_stdin()?,
    };

    // Validating the token up front also resolves the display name.
    let user = reputation::fetch_authenticated_user(&token)
        .await
        .context("The token was rejected by the identity provider")?;

    let keystore = Keystore::new(&opts.keystore);
    keystore.save(&token, &user.login)?;
    info!("Stored credentials for {}", user.login);
    println!("Logged in as {}", user.login);
    Ok(())
}

pub fn logout_subcommand(opts: &LogoutOptions) -> Result<()> {
    let keystore = Keystore::new(&opts.keystore);
    keystore.clear()?;
    println!("Logged out");
    Ok(())
}

fn read_token_from_stdin() -> Result<SecretString> {
    print!("Paste your access token: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(SecretString::new(line.trim().to_string()))
}
