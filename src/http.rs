use once_cell::sync::Lazy;
use reqwest::Client;

// Shared HTTP client with reasonable defaults for timeouts
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .user_agent(concat!("dejatune/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .expect("failed to build HTTP client")
});

/// HTTP client shared by the oracle and catalog backends.
pub(crate) fn http_client() -> &'static Client {
    &HTTP_CLIENT
}
