use clap::AppSettings;
use structopt::StructOpt;
use url::Url;

use std::path::PathBuf;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "contribute",
    about = "Contribute to a Phase 2 zKey ceremony",
    rename_all = "snake-case",
    setting(AppSettings::ColoredHelp),
    setting(AppSettings::DisableHelpSubcommand),
    setting(AppSettings::DisableVersion)
)]
pub struct ContributeOptions {
    /// Identifier of the ceremony to contribute to.
    #[structopt(rename_all = "screaming-snake-case")]
    pub ceremony_id: String,

    /// URL of the ceremony coordinator API.
    #[structopt(rename_all = "screaming-snake-case")]
    pub coordinator_api_url: Url,

    /// Path of the keystore written by the login subcommand.
    #[structopt(long, default_value = ".phase2-keys.json", parse(from_os_str))]
    pub keystore: PathBuf,

    /// Directory for zkey scratch files while a contribution is in flight.
    #[structopt(long, default_value = ".phase2-scratch", parse(from_os_str))]
    pub working_dir: PathBuf,

    /// Command invoked to apply the zkey contribution.
    #[structopt(long, default_value = "snarkjs")]
    pub zkey_tool: String,
}
