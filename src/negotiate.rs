//! Negotiation with the SignalR server.
//!
//! Before a transport is started, the client performs an HTTP POST to the
//! `/negotiate` endpoint. The server answers with the connection identity and
//! the transports it supports, or redirects the client to another endpoint.
//!
//! This module handles the negotiation request, redirects and the response.

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{Result, SignalRError},
    protocol::TransferFormat,
    transport::{ensure_success, TransportContext, TransportKind},
};

/// Maximum number of negotiate requests, counting the final one.
pub const MAX_REDIRECTS: usize = 100;

const INVALID_RESPONSE: &str = "Invalid negotiation response received.";

/// Raw response from the `/negotiate` endpoint.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    #[serde(default)]
    negotiate_version: u32,
    #[serde(default)]
    available_transports: Vec<RawAvailableTransport>,
    #[serde(alias = "redirectUrl")]
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawAvailableTransport {
    transport: String,
    #[serde(default)]
    transfer_formats: Vec<String>,
}

/// A transport advertised by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableTransport {
    pub transport: TransportKind,
    pub transfer_formats: Vec<TransferFormat>,
}

/// Outcome of a negotiation, after following every redirect.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationResult {
    /// The hub URL the connection must use; differs from the requested one
    /// after a redirect.
    pub url: Url,
    pub connection_id: Option<String>,
    /// Present when `negotiate_version >= 1`.
    pub connection_token: Option<String>,
    pub negotiate_version: u32,
    pub available_transports: Vec<AvailableTransport>,
}

impl NegotiationResult {
    /// Builds a result for a connection that skipped negotiation.
    pub(crate) fn skipped(url: Url) -> Self {
        Self {
            url,
            connection_id: None,
            connection_token: None,
            negotiate_version: 0,
            available_transports: vec![AvailableTransport {
                transport: TransportKind::WebSockets,
                transfer_formats: vec![TransferFormat::Text, TransferFormat::Binary],
            }],
        }
    }

    /// The server-side identifier sent as the `id` query parameter.
    pub fn connection_key(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }

    /// The URL transports connect to: the hub URL plus `id=<connection key>`.
    pub fn transport_url(&self) -> Url {
        let mut url = self.url.clone();
        if let Some(key) = self.connection_key() {
            url.query_pairs_mut().append_pair("id", key);
        }
        url
    }

    pub fn find(&self, kind: TransportKind) -> Option<&AvailableTransport> {
        self.available_transports
            .iter()
            .find(|available| available.transport == kind)
    }
}

/// Builds `{url}/negotiate?negotiateVersion=1`, keeping the original query.
pub fn negotiate_url(hub_url: &Url) -> Url {
    let mut negotiate_url = hub_url.clone();

    let mut path = negotiate_url.path().to_string();
    if path.ends_with('/') {
        path.pop();
    }
    path.push_str("/negotiate");
    negotiate_url.set_path(&path);
    negotiate_url.set_fragment(None);

    // A redirect URL may already carry the version.
    if !negotiate_url
        .query_pairs()
        .any(|(name, _)| name == "negotiateVersion")
    {
        negotiate_url
            .query_pairs_mut()
            .append_pair("negotiateVersion", "1");
    }
    negotiate_url
}

/// Performs negotiate requests on behalf of one physical connection.
#[derive(Clone)]
pub struct NegotiateClient {
    context: TransportContext,
}

impl NegotiateClient {
    pub fn new(context: TransportContext) -> Self {
        Self { context }
    }

    /// Negotiates with `hub_url`, following up to [`MAX_REDIRECTS`] redirects.
    ///
    /// A redirect carrying an access token replaces the token used for every
    /// later request of this connection.
    ///
    /// # Errors
    ///
    /// * [`SignalRError::Negotiation`] if the response is malformed, the
    ///   server reports an error, or the redirect limit is exceeded.
    /// * [`SignalRError::Unauthorized`] if the server answers `401`.
    pub async fn negotiate(&self, hub_url: &Url) -> Result<NegotiationResult> {
        let mut url = hub_url.clone();

        for _ in 0..MAX_REDIRECTS {
            let response = self.negotiate_once(&url).await?;

            if let Some(error) = response.error {
                return Err(SignalRError::Negotiation(error));
            }

            if let Some(redirect) = response.url {
                url = Url::parse(&redirect)?;
                debug!(url = %url, "Negotiate redirected");
                if let Some(token) = response.access_token {
                    self.context.access_token.adopt(token).await;
                }
                continue;
            }

            return into_result(url, response);
        }

        Err(SignalRError::Negotiation(
            "Negotiate redirection limit exceeded.".into(),
        ))
    }

    async fn negotiate_once(&self, url: &Url) -> Result<NegotiateResponse> {
        let negotiate_url = negotiate_url(url);
        debug!("Negotiate URL: {}", negotiate_url);

        let response = self
            .context
            .request(Method::POST, &negotiate_url)
            .await?
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await?;
        let response = ensure_success(response).await?;
        let body = response.bytes().await?;

        serde_json::from_slice(&body).map_err(|e| {
            debug!("Response text: {}", String::from_utf8_lossy(&body));
            warn!("Failed to parse negotiate response: {}", e);
            SignalRError::Negotiation(INVALID_RESPONSE.into())
        })
    }
}

fn into_result(url: Url, response: NegotiateResponse) -> Result<NegotiationResult> {
    let invalid = || SignalRError::Negotiation(INVALID_RESPONSE.into());

    let connection_id = response.connection_id.ok_or_else(invalid)?;
    if response.negotiate_version >= 1 && response.connection_token.is_none() {
        return Err(invalid());
    }

    let available_transports = response
        .available_transports
        .into_iter()
        .filter_map(|raw| {
            let Ok(transport) = raw.transport.parse() else {
                debug!("Ignoring unknown transport '{}'", raw.transport);
                return None;
            };
            let transfer_formats = raw
                .transfer_formats
                .iter()
                .filter_map(|format| match format.as_str() {
                    "Text" => Some(TransferFormat::Text),
                    "Binary" => Some(TransferFormat::Binary),
                    _ => None,
                })
                .collect();
            Some(AvailableTransport {
                transport,
                transfer_formats,
            })
        })
        .collect();

    Ok(NegotiationResult {
        url,
        connection_id: Some(connection_id),
        connection_token: response.connection_token,
        negotiate_version: response.negotiate_version,
        available_transports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_url_keeps_query() {
        let url = Url::parse("http://localhost:5000/chathub/?tenant=a#frag").unwrap();
        assert_eq!(
            negotiate_url(&url).as_str(),
            "http://localhost:5000/chathub/negotiate?tenant=a&negotiateVersion=1"
        );
    }

    #[test]
    fn negotiate_version_is_not_appended_twice() {
        let url = Url::parse("http://other/hub?negotiateVersion=1&x=y").unwrap();
        assert_eq!(
            negotiate_url(&url).as_str(),
            "http://other/hub/negotiate?negotiateVersion=1&x=y"
        );
    }

    fn parse(body: &str) -> NegotiateResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn version_one_requires_connection_token() {
        let url = Url::parse("http://localhost/hub").unwrap();
        let err = into_result(
            url,
            parse(r#"{"connectionId":"abc","negotiateVersion":1,"availableTransports":[]}"#),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), INVALID_RESPONSE);
    }

    #[test]
    fn transport_url_uses_token_for_version_one() {
        let url = Url::parse("http://localhost/hub").unwrap();
        let result = into_result(
            url.clone(),
            parse(
                r#"{"connectionId":"id","connectionToken":"tok","negotiateVersion":1,
                    "availableTransports":[
                        {"transport":"WebSockets","transferFormats":["Text","Binary"]},
                        {"transport":"WebTransport","transferFormats":["Binary"]},
                        {"transport":"LongPolling","transferFormats":["Text"]}]}"#,
            ),
        )
        .unwrap();
        assert_eq!(result.transport_url().as_str(), "http://localhost/hub?id=tok");
        assert_eq!(result.available_transports.len(), 2);
        assert_eq!(
            result.find(TransportKind::LongPolling).unwrap().transfer_formats,
            vec![TransferFormat::Text]
        );

        let legacy = into_result(url, parse(r#"{"connectionId":"id"}"#)).unwrap();
        assert_eq!(legacy.transport_url().as_str(), "http://localhost/hub?id=id");
    }
}
