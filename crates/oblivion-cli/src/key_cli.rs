use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::SecondsFormat;
use tracing::{debug, info, warn};

use oblivion_key_client::{DEFAULT_REQUEST_ATTEMPTS, KeyServiceClient, KeyServiceClientConfig};
use oblivion_key_core::config::clamp_poll_interval;
use oblivion_key_core::session::ResolvedSid;
use oblivion_key_core::{
    AcquisitionError, AttemptResult, FileSessionStore, IssuedKey, KeyAcquisitionController,
    Navigator, PortalConfig, SessionIdentity, Sid,
};

use crate::{ReturnArgs, VerifyArgs};

/// reqwest's own deadline trails the controller's, so a hung request
/// surfaces as `TimedOut` rather than as a transport error.
const TRANSPORT_TIMEOUT_GRACE_MS: u64 = 1_000;

pub(crate) struct Portal {
    config: PortalConfig,
    identity: SessionIdentity<FileSessionStore>,
}

impl Portal {
    pub(crate) fn load(service_url: Option<&str>, session_file: Option<PathBuf>) -> Result<Self> {
        let mut config = PortalConfig::from_env().context("load portal configuration")?;
        if let Some(url) = service_url {
            config = config
                .with_key_service_url(url)
                .context("invalid --service-url")?;
        }
        if session_file.is_some() {
            config.session_file = session_file;
        }
        Ok(Self::from_config(config))
    }

    pub(crate) fn from_config(config: PortalConfig) -> Self {
        let store = config
            .session_file
            .clone()
            .map_or_else(FileSessionStore::open_default, FileSessionStore::new);
        debug!(path = %store.path().display(), "session store");
        Self {
            config,
            identity: SessionIdentity::new(store),
        }
    }

    fn client(&self) -> Result<KeyServiceClient> {
        KeyServiceClient::new(KeyServiceClientConfig {
            base_url: self.config.key_service_url.clone(),
            timeout_ms: transport_timeout_ms(self.config.request_timeout),
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        })
        .context("build key service client")
    }

    fn controller(&self) -> Result<KeyAcquisitionController<KeyServiceClient>> {
        let acquisition = self
            .config
            .acquisition()
            .context("resolve acquisition settings")?;
        Ok(KeyAcquisitionController::new(self.client()?, acquisition))
    }

    /// Inbound SID wins and is persisted; otherwise stored, otherwise generated.
    fn resolve(&self, inbound: Option<&str>) -> Result<ResolvedSid, AcquisitionError> {
        let resolved = self
            .identity
            .resolve_with_source(inbound)
            .map_err(AcquisitionError::from)?;
        info!(sid = %resolved.sid, source = resolved.source.as_str(), "session resolved");
        Ok(resolved)
    }

    /// Explicit SID, else the stored one. Never generates.
    fn existing_sid(&self, explicit: Option<&str>) -> Result<Sid> {
        if let Some(raw) = explicit {
            return Sid::parse(raw).ok_or_else(|| anyhow!("--sid must not be blank"));
        }
        self.identity
            .current()
            .map_err(AcquisitionError::from)?
            .ok_or_else(|| anyhow!("no session found; run `oblivion get-key` first"))
    }
}

/// Prints the ad link; the user completes the gate in a browser.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, url: &str) {
        println!("Complete the ad to unlock your key:");
        println!("  {url}");
    }
}

pub(crate) fn sid(portal: &Portal, args: &ReturnArgs) -> Result<()> {
    let inbound = args.inbound_sid()?;
    let resolved = portal.resolve(inbound.as_deref())?;
    println!("{} ({})", resolved.sid, resolved.source.as_str());
    Ok(())
}

pub(crate) async fn get_key(portal: &Portal, args: &ReturnArgs) -> Result<()> {
    let inbound = args.inbound_sid()?;
    let resolved = portal.resolve(inbound.as_deref())?;

    let controller = portal.controller()?;
    match controller.request_key(&resolved.sid).await {
        AttemptResult::Issued(key) => {
            print_key(&key);
            Ok(())
        }
        AttemptResult::Gated(redirect) => {
            let departure = controller.depart(&redirect, &TerminalNavigator);
            println!("Then run: oblivion verify --sid {}", departure.sid);
            Ok(())
        }
        AttemptResult::Failed(error) => Err(explain(&error)),
    }
}

pub(crate) async fn verify(portal: &Portal, args: &VerifyArgs) -> Result<()> {
    let sid = match args.inbound.inbound_sid()? {
        Some(raw) => portal.resolve(Some(raw.as_str()))?.sid,
        None => portal.existing_sid(None)?,
    };

    let mut controller = portal.controller()?;
    match controller.check_existing(&sid).await {
        Ok(Some(key)) => {
            print_key(&key);
            return Ok(());
        }
        Ok(None) => {}
        Err(error) => warn!(sid = %sid, %error, "existing key check failed; polling anyway"),
    }

    let interval = args
        .interval_ms
        .map_or(portal.config.poll_interval, clamp_poll_interval);
    println!("Waiting for the ad to be confirmed for {sid}...");
    controller.start_polling(sid.clone(), interval, |attempt| {
        debug!(
            status = attempt.status.as_str(),
            error = attempt.last_error.as_deref(),
            "poll tick"
        );
    });

    let max_wait = (args.max_wait_secs > 0).then(|| Duration::from_secs(args.max_wait_secs));
    let issued = controller.wait_for_issued(max_wait).await;
    controller.stop_polling();

    match issued {
        Some(key) => {
            print_key(&key);
            Ok(())
        }
        None => match controller.attempt().last_error {
            Some(error) => bail!(
                "no key issued within {}s (last error: {error})",
                args.max_wait_secs
            ),
            None => bail!(
                "no key issued within {}s; finish the ad, then run `oblivion verify` again",
                args.max_wait_secs
            ),
        },
    }
}

pub(crate) async fn check(portal: &Portal, sid: Option<&str>) -> Result<()> {
    let sid = portal.existing_sid(sid)?;
    let controller = portal.controller()?;
    match controller
        .check_existing(&sid)
        .await
        .map_err(|error| explain(&error))?
    {
        Some(key) => print_key(&key),
        None => println!("No usable key for {sid}"),
    }
    Ok(())
}

pub(crate) async fn postback(portal: &Portal, sid: Option<&str>) -> Result<()> {
    let sid = portal.existing_sid(sid)?;
    let reply = portal
        .client()?
        .postback(sid.as_str())
        .await
        .context("postback request")?;
    println!("postback {sid}: http {}", reply.status);
    let body = reply.body.trim();
    if !body.is_empty() {
        println!("{body}");
    }
    Ok(())
}

fn print_key(key: &IssuedKey) {
    println!("key: {}", key.key);
    if let Some(expires_at) = key.expires_at() {
        println!(
            "expires: {}",
            expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
}

fn transport_timeout_ms(request_timeout: Option<Duration>) -> u64 {
    request_timeout.map_or(0, |timeout| {
        (timeout.as_millis() as u64).saturating_add(TRANSPORT_TIMEOUT_GRACE_MS)
    })
}

fn explain(error: &AcquisitionError) -> anyhow::Error {
    if error.is_service_unavailable() {
        anyhow!("{error}; the key service may be starting up, try again in a moment")
    } else {
        anyhow!("{error}")
    }
}
