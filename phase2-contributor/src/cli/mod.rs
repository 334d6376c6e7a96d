pub mod commands;

use clap::AppSettings;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
pub enum Command {
    Login(commands::auth::LoginOptions),
    Logout(commands::auth::LogoutOptions),
    Contribute(commands::contribute::ContributeOptions),
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "Phase 2 Contributor",
    setting(AppSettings::ColoredHelp),
    setting(AppSettings::DisableHelpSubcommand),
    setting(AppSettings::DisableVersion),
    setting(AppSettings::SubcommandRequiredElseHelp)
)]
pub struct Options {
    #[structopt(subcommand)]
    pub subcommand: Command,
}
