//! Outbound ad-gate redirect and the inbound return contract.

use url::{Url, form_urlencoded};

use crate::session::Sid;

pub const DEFAULT_AD_TARGET_PARAM: &str = "url";
pub const RETURN_SID_PARAM: &str = "sid";

/// Full-navigation target for an unsatisfied gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdRedirect {
    /// Ad link with the return URL embedded as a percent-encoded parameter.
    pub url: String,
    /// Verify page carrying `?sid=`; where the ad network sends the visitor back.
    pub return_url: String,
    pub sid: Sid,
}

/// Leaves the application for an external URL.
pub trait Navigator {
    fn navigate(&self, url: &str);
}

/// Proof that the controller left for the ad gate; nothing resumes from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub url: String,
    pub sid: Sid,
}

#[must_use]
pub fn return_url(verify_url: &str, sid: &Sid) -> String {
    format!(
        "{verify_url}{}{RETURN_SID_PARAM}={}",
        query_separator(verify_url),
        urlencoding::encode(sid.as_str())
    )
}

/// The nested return URL is fully percent-encoded so shorteners in the
/// redirect chain cannot split it at its own `?` or `&`.
#[must_use]
pub fn build_ad_redirect(
    ad_link_url: &str,
    target_param: &str,
    verify_url: &str,
    sid: &Sid,
) -> AdRedirect {
    let return_url = return_url(verify_url, sid);
    let url = format!(
        "{ad_link_url}{}{target_param}={}",
        query_separator(ad_link_url),
        urlencoding::encode(&return_url)
    );
    AdRedirect {
        url,
        return_url,
        sid: sid.clone(),
    }
}

/// Extracts `sid` from a return URL. Accepts a full URL, `?sid=...` or a
/// bare query string.
#[must_use]
pub fn parse_return_sid(raw: &str) -> Option<Sid> {
    let trimmed = raw.trim();
    if let Ok(url) = Url::parse(trimmed) {
        return find_sid(url.query_pairs());
    }
    let query = trimmed
        .split_once('?')
        .map_or(trimmed, |(_, query)| query);
    find_sid(form_urlencoded::parse(query.as_bytes()))
}

fn find_sid<'a>(
    mut pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>,
) -> Option<Sid> {
    pairs
        .find(|(key, _)| key == RETURN_SID_PARAM)
        .and_then(|(_, value)| Sid::parse(&value))
}

fn query_separator(base: &str) -> &'static str {
    if !base.contains('?') {
        "?"
    } else if base.ends_with('?') || base.ends_with('&') {
        ""
    } else {
        "&"
    }
}
