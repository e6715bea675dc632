// Marketpost Infrastructure - HTTP Adapter
// Implements: HttpTransport, TokenEndpoint

mod oauth;
mod transport;

pub use oauth::{
    authorize_url, OAuthCredentials, OAuthTokenEndpoint, DEFAULT_SCOPES, PRODUCTION_AUTH_HOST,
    SANDBOX_AUTH_HOST, TOKEN_PATH, TOKEN_REQUEST_TIMEOUT,
};
pub use transport::{base_url_for, ReqwestTransport, PRODUCTION_BASE_URL, SANDBOX_BASE_URL};
