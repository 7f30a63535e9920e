//! OAuth2 for the Drive proxy: the one-shot authorization flow (`auth`) and
//! the authenticated Drive hub used by the server.
//!
//! The authorization flow is a small state machine:
//!
//! ```text
//! Idle -> AwaitingBrowserRedirect -> ExchangingCode -> Completed
//!                 |                        |
//!                 +--------> Failed <------+
//! ```
//!
//! It waits for exactly one request on the callback path. Other paths get a
//! 404 and leave the state untouched.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_drive3::DriveHub;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use url::Url;
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::{InstalledFlowAuthenticator, InstalledFlowReturnMethod};

use crate::config::{Config, DRIVE_SCOPE, OAUTH_CALLBACK_PATH};
use crate::credentials::{load_client_secret, ClientSecret, TokenSet, TokenStore};
use crate::error::AppError;

pub type DriveHubType = DriveHub<HttpsConnector<HttpConnector>>;

/// How long one connection may take to send its request head. Browsers open
/// speculative connections that never send anything.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>Authentication Successful</title>\
    </head><body><h1>Authentication successful</h1>\
    <p>You can close this tab and return to the terminal.</p>\
    <script>setTimeout(() => window.close(), 2000)</script></body></html>";

fn https_connector() -> Result<HttpsConnector<HttpConnector>, AppError> {
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?
        .https_only()
        .enable_http2()
        .build())
}

/// Authorization URL for the consent screen. Offline access plus forced
/// consent so Google always returns a refresh token.
pub fn authorization_url(secret: &ClientSecret, redirect_uri: &str) -> Result<String, AppError> {
    let url = Url::parse_with_params(
        &secret.auth_uri,
        &[
            ("client_id", secret.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", DRIVE_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| AppError::Configuration(format!("invalid auth_uri {:?}: {e}", secret.auth_uri)))?;
    Ok(url.into())
}

/// Trades an authorization code for tokens at the identity provider.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<TokenSet, AppError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
    id_token: Option<String>,
}

impl TokenResponse {
    fn into_token_set(self, now: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access_token: Some(self.access_token),
            refresh_token: self.refresh_token,
            expiry_date: self
                .expires_in
                .map(|secs| now.timestamp_millis() + secs * 1000),
            scope: self.scope,
            token_type: self.token_type,
            id_token: self.id_token,
            ..Default::default()
        }
    }
}

/// Exchanges codes against the token endpoint from the client secret.
pub struct GoogleCodeExchanger {
    secret: ClientSecret,
    redirect_uri: String,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl GoogleCodeExchanger {
    pub fn new(secret: ClientSecret, redirect_uri: String) -> Result<Self, AppError> {
        let client = Client::builder(TokioExecutor::new()).build(https_connector()?);
        Ok(Self {
            secret,
            redirect_uri,
            client,
        })
    }
}

#[async_trait]
impl CodeExchanger for GoogleCodeExchanger {
    async fn exchange(&self, code: &str) -> Result<TokenSet, AppError> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("code", code)
            .append_pair("client_id", &self.secret.client_id)
            .append_pair("client_secret", &self.secret.client_secret)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("grant_type", "authorization_code")
            .finish();

        let request = hyper::Request::post(&self.secret.token_uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| AppError::TokenExchange(e.to_string()))?;

        tracing::info!("exchanging authorization code at {}", self.secret.token_uri);
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| AppError::TokenExchange(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| AppError::TokenExchange(format!("failed to read token response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(AppError::TokenExchange(format!(
                "{status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let response: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| AppError::TokenExchange(format!("unexpected token response: {e}")))?;
        Ok(response.into_token_set(Utc::now()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingBrowserRedirect,
    ExchangingCode,
    Completed,
    Failed,
}

/// Query parameters the identity provider sends back to the redirect URI.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    pub fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// Local listener for the OAuth redirect.
#[derive(Debug)]
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    /// Bind on loopback. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self, AppError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot listen for the OAuth callback on port {port}: {e}"),
            ))
        })?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> Result<u16, AppError> {
        Ok(self.listener.local_addr()?.port())
    }
}

type HtmlResponse = Response<Full<Bytes>>;

/// A request on the callback path, handed from the connection to the flow.
struct CallbackRequest {
    params: CallbackParams,
    reply: oneshot::Sender<HtmlResponse>,
}

fn html_response(status: StatusCode, body: String) -> HtmlResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

async fn route(
    request: Request<Incoming>,
    callbacks: mpsc::Sender<CallbackRequest>,
) -> Result<HtmlResponse, Infallible> {
    let path = request.uri().path();
    if path != OAUTH_CALLBACK_PATH {
        tracing::debug!("404 for {path}");
        return Ok(html_response(StatusCode::NOT_FOUND, String::new()));
    }

    let params = CallbackParams::parse(request.uri().query().unwrap_or_default());
    let (reply, response) = oneshot::channel();
    if callbacks.send(CallbackRequest { params, reply }).await.is_err() {
        return Ok(html_response(
            StatusCode::GONE,
            "Authorization already finished.".into(),
        ));
    }
    Ok(response.await.unwrap_or_else(|_| {
        html_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Authorization was interrupted.".into(),
        )
    }))
}

/// Serve one HTTP/1.1 connection, forwarding callback requests to `callbacks`.
/// Resolves once the response has been written and the connection closed.
async fn serve_connection(stream: TcpStream, callbacks: mpsc::Sender<CallbackRequest>) {
    let service = service_fn(move |request| route(request, callbacks.clone()));
    let connection = http1::Builder::new()
        .keep_alive(false)
        .timer(TokioTimer::new())
        .header_read_timeout(REQUEST_READ_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service);
    if let Err(e) = connection.await {
        tracing::debug!("callback connection ended: {e}");
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn error_response(err: &AppError) -> HtmlResponse {
    let status = match err {
        AppError::OAuthDenied(_) | AppError::MissingAuthorizationCode => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = format!(
        "<!DOCTYPE html><html><head><title>Authentication Failed</title></head>\
         <body><h1>Authentication failed</h1><p>{}</p></body></html>",
        escape_html(&err.to_string())
    );
    html_response(status, body)
}

/// One authorization attempt: waits for the redirect, exchanges the code and
/// persists the tokens.
pub struct AuthFlow<E> {
    exchanger: E,
    store: TokenStore,
    state: FlowState,
}

impl<E: CodeExchanger> AuthFlow<E> {
    pub fn new(exchanger: E, store: TokenStore) -> Self {
        Self {
            exchanger,
            store,
            state: FlowState::Idle,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    fn transition(&mut self, next: FlowState) {
        tracing::debug!("auth flow: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Serve `listener` until the callback request arrives, then finish the
    /// flow. The listener is consumed and closed on every exit.
    ///
    /// There is no overall timeout: an operator who never finishes the
    /// browser step leaves this waiting.
    pub async fn complete(&mut self, listener: CallbackListener) -> Result<(), AppError> {
        self.transition(FlowState::AwaitingBrowserRedirect);

        loop {
            let (stream, peer) = match listener.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.transition(FlowState::Failed);
                    return Err(AppError::Io(e));
                }
            };
            tracing::debug!("callback connection from {peer}");

            let (callbacks, mut requests) = mpsc::channel::<CallbackRequest>(1);
            let handled = async {
                // None once the connection is done without hitting the callback path
                let Some(request) = requests.recv().await else {
                    return None;
                };
                let outcome = self.handle_callback(request.params).await;
                let response = match &outcome {
                    Ok(()) => html_response(StatusCode::OK, SUCCESS_PAGE.into()),
                    Err(e) => error_response(e),
                };
                if request.reply.send(response).is_err() {
                    tracing::warn!("callback connection closed before the response was sent");
                }
                Some(outcome)
            };
            let ((), outcome) = tokio::join!(serve_connection(stream, callbacks), handled);

            if let Some(outcome) = outcome {
                self.transition(if outcome.is_ok() {
                    FlowState::Completed
                } else {
                    FlowState::Failed
                });
                return outcome;
            }
        }
    }

    async fn handle_callback(&mut self, params: CallbackParams) -> Result<(), AppError> {
        if let Some(error) = params.error {
            return Err(AppError::OAuthDenied(error));
        }
        let code = params
            .code
            .filter(|code| !code.is_empty())
            .ok_or(AppError::MissingAuthorizationCode)?;

        self.transition(FlowState::ExchangingCode);
        let tokens = self.exchanger.exchange(&code).await?;
        self.store.replace(&tokens).await?;
        tracing::debug!("Token expires: {:?}", tokens.expires_at());
        Ok(())
    }
}

/// Run the interactive OAuth2 flow: opens a browser, waits for consent, saves tokens.
pub async fn run_auth_flow(config: &Config) -> Result<(), AppError> {
    let secret = load_client_secret(config).await?;
    let redirect_uri = config.redirect_uri();
    let auth_url = authorization_url(&secret, &redirect_uri)?;

    let listener = CallbackListener::bind(config.redirect_port).await?;
    tracing::info!(
        "Waiting for Google sign-in on http://localhost:{}{OAUTH_CALLBACK_PATH}",
        listener.port()?
    );
    tracing::info!("If the browser does not open, visit:\n{auth_url}");
    if let Err(e) = webbrowser::open(&auth_url) {
        tracing::warn!("could not open a browser: {e}");
    }

    let exchanger = GoogleCodeExchanger::new(secret, redirect_uri)?;
    let mut flow = AuthFlow::new(exchanger, TokenStore::on_disk(config));
    flow.complete(listener).await?;

    tracing::info!("Authentication successful!");
    tracing::info!("Tokens saved to {}", config.token_path().display());
    Ok(())
}

/// Refuses the interactive fallback yup-oauth2 would otherwise start when the
/// stored refresh token stops working; stdout belongs to the MCP transport.
struct ReauthenticateDelegate;

impl InstalledFlowDelegate for ReauthenticateDelegate {
    fn present_user_url<'a>(
        &'a self,
        _url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>> {
        Box::pin(async {
            Err("stored tokens are no longer valid; run `gdrive-mcp auth` again".to_string())
        })
    }
}

/// Build the Drive hub from previously saved tokens. Token refreshes are
/// merged back into the token file through [`TokenStore`].
pub async fn build_hub(config: &Config) -> Result<DriveHubType, AppError> {
    let secret = load_client_secret(config).await?;
    let store = TokenStore::on_disk(config);
    let tokens = store.load().await?;
    tracing::debug!("Token expires: {:?}", tokens.expires_at());

    let auth = InstalledFlowAuthenticator::builder(
        secret.to_application_secret(&config.redirect_uri()),
        InstalledFlowReturnMethod::HTTPPortRedirect(config.redirect_port),
    )
    .flow_delegate(Box::new(ReauthenticateDelegate))
    .with_storage(Box::new(store))
    .build()
    .await
    .map_err(|e| AppError::OAuth2(e.to_string()))?;

    let client = Client::builder(TokioExecutor::new()).build(https_connector()?);
    let hub = DriveHub::new(client, auth);

    tracing::info!("Google Drive hub ready");
    Ok(hub)
}
