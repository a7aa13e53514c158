#![allow(clippy::print_stdout)]

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Parser};

use oblivion_key_core::parse_return_sid;

mod key_cli;

#[derive(Parser, Debug)]
#[command(name = "oblivion")]
#[command(about = "Oblivion key portal client")]
pub struct OblivionCli {
    /// KeyService base URL (overrides OBLIVION_KEY_SERVICE_URL)
    #[arg(long, global = true)]
    pub service_url: Option<String>,
    /// Session file holding the SID (overrides OBLIVION_SESSION_FILE)
    #[arg(long, global = true)]
    pub session_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Resolve the session ID and show where it came from
    Sid(ReturnArgs),
    /// Request an access key, leaving for the ad gate when required
    GetKey(ReturnArgs),
    /// Return from the ad gate and wait for the key to be issued
    Verify(VerifyArgs),
    /// Show whether the session already holds a usable key
    Check {
        #[arg(long)]
        sid: Option<String>,
    },
    /// Ping the development postback endpoint for a session
    Postback {
        #[arg(long)]
        sid: Option<String>,
    },
}

/// Inbound SID from the ad gate, either bare or inside the return URL.
#[derive(Args, Debug, Clone, Default)]
pub struct ReturnArgs {
    #[arg(long, conflicts_with = "return_url")]
    pub sid: Option<String>,
    /// Return URL as delivered by the ad gate, e.g. https://site/verify?sid=SID-XXXXXXX
    #[arg(long)]
    pub return_url: Option<String>,
}

impl ReturnArgs {
    pub fn inbound_sid(&self) -> Result<Option<String>> {
        if let Some(raw) = self.return_url.as_deref() {
            let sid =
                parse_return_sid(raw).ok_or_else(|| anyhow!("return url carries no sid: {raw}"))?;
            return Ok(Some(sid.into_string()));
        }
        Ok(self.sid.clone())
    }
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    #[command(flatten)]
    pub inbound: ReturnArgs,
    /// Poll interval override in milliseconds (minimum 250)
    #[arg(long)]
    pub interval_ms: Option<u64>,
    /// Give up after this many seconds; 0 waits indefinitely
    #[arg(long, default_value_t = 120)]
    pub max_wait_secs: u64,
}

pub async fn run() -> Result<()> {
    let cli = OblivionCli::parse();
    execute(cli).await
}

pub async fn execute(cli: OblivionCli) -> Result<()> {
    let portal = key_cli::Portal::load(cli.service_url.as_deref(), cli.session_file)?;
    match cli.command {
        Commands::Sid(args) => key_cli::sid(&portal, &args),
        Commands::GetKey(args) => key_cli::get_key(&portal, &args).await,
        Commands::Verify(args) => key_cli::verify(&portal, &args).await,
        Commands::Check { sid } => key_cli::check(&portal, sid.as_deref()).await,
        Commands::Postback { sid } => key_cli::postback(&portal, sid.as_deref()).await,
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::{Commands, OblivionCli};

    #[test]
    fn cli_requires_subcommand() {
        let err = match OblivionCli::try_parse_from(["oblivion"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn cli_rejects_unknown_subcommand() {
        let err = match OblivionCli::try_parse_from(["oblivion", "unknown-subcommand"]) {
            Ok(_) => panic!("expected invalid subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn verify_defaults_and_global_flags() {
        let cli = OblivionCli::try_parse_from([
            "oblivion",
            "verify",
            "--sid",
            "SID-ABC1234",
            "--service-url",
            "http://127.0.0.1:9",
        ])
        .expect("verify parses");
        assert_eq!(cli.service_url.as_deref(), Some("http://127.0.0.1:9"));
        let Commands::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert_eq!(args.max_wait_secs, 120);
        assert_eq!(args.interval_ms, None);
        assert_eq!(
            args.inbound.inbound_sid().expect("inbound sid"),
            Some("SID-ABC1234".to_string())
        );
    }

    #[test]
    fn get_key_accepts_an_inbound_sid() {
        let cli = OblivionCli::try_parse_from(["oblivion", "get-key", "--sid", "SID-URL0001"])
            .expect("get-key parses");
        let Commands::GetKey(args) = cli.command else {
            panic!("expected get-key");
        };
        assert_eq!(
            args.inbound_sid().expect("inbound sid"),
            Some("SID-URL0001".to_string())
        );

        let bare = OblivionCli::try_parse_from(["oblivion", "get-key"]).expect("get-key parses");
        let Commands::GetKey(args) = bare.command else {
            panic!("expected get-key");
        };
        assert_eq!(args.inbound_sid().expect("inbound sid"), None);
    }

    #[test]
    fn sid_and_return_url_conflict() {
        let err = match OblivionCli::try_parse_from([
            "oblivion",
            "sid",
            "--sid",
            "SID-ABC1234",
            "--return-url",
            "https://portal.example.com/verify?sid=SID-ABC1234",
        ]) {
            Ok(_) => panic!("expected argument conflict"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn return_url_yields_its_sid() {
        let cli = OblivionCli::try_parse_from([
            "oblivion",
            "sid",
            "--return-url",
            "https://portal.example.com/verify?sid=SID-RET0001",
        ])
        .expect("sid parses");
        let Commands::Sid(args) = cli.command else {
            panic!("expected sid");
        };
        assert_eq!(
            args.inbound_sid().expect("inbound sid"),
            Some("SID-RET0001".to_string())
        );

        let bare = super::ReturnArgs {
            sid: None,
            return_url: Some("https://portal.example.com/verify".to_string()),
        };
        assert!(bare.inbound_sid().is_err());
    }
}
