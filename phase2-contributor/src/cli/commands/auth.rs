use clap::AppSettings;
use secrecy::SecretString;
use structopt::StructOpt;

use std::path::PathBuf;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "login",
    about = "Store the identity-provider access token locally",
    setting(AppSettings::ColoredHelp)
)]
pub struct LoginOptions {
    /// Personal access token with the gist scope. Prompted on stdin when
    /// not given.
    #[structopt(long)]
    pub token: Option<SecretString>,

    /// Path of the keystore to write.
    #[structopt(long, default_value = ".phase2-keys.json", parse(from_os_str))]
    pub keystore: PathBuf,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "logout",
    about = "Remove the locally stored access token",
    setting(AppSettings::ColoredHelp)
)]
pub struct LogoutOptions {
    /// Path of the keystore to remove.
    #[structopt(long, default_value = ".phase2-keys.json", parse(from_os_str))]
    pub keystore: PathBuf,
}
