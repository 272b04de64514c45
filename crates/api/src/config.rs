//! Server configuration

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooler) URL for migrations; falls back to `database_url`.
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    /// Bearer token protecting the `/admin` surface.
    pub admin_token: String,
    /// Scheduling page a redeemed pass redirects to.
    pub calendly_event_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            admin_token: required("ADMIN_TOKEN")?,
            calendly_event_url: required("CALENDLY_EVENT_URL")?,
        })
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{name} must be set"))
}
