use std::time::Duration;

pub const DEFAULT_EXTENSION_ORIGIN: &str = "chrome-extension://guardian/";
pub const DEFAULT_PAIRING_URL: &str = "https://guardian.niot.space/";
pub const DEFAULT_PROVIDER_MARKER: &str = "nos2x";
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    /// Base url of extension-owned pages, with trailing slash.
    pub extension_origin: String,
    pub pairing_url: String,
    pub provider_marker: String,
    pub channel_label: String,
    pub ice_servers: Vec<String>,
    pub rpc_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_filter: String,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            extension_origin: DEFAULT_EXTENSION_ORIGIN.into(),
            pairing_url: DEFAULT_PAIRING_URL.into(),
            provider_marker: DEFAULT_PROVIDER_MARKER.into(),
            channel_label: transport_webrtc::DEFAULT_CHANNEL_LABEL.into(),
            ice_servers: Vec::new(),
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            log_filter: "info,guardian=debug".into(),
        }
    }
}

impl GuardianConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let extension_origin = lookup("GUARDIAN_EXTENSION_ORIGIN")
            .map(|origin| with_trailing_slash(&origin))
            .unwrap_or(defaults.extension_origin);
        let pairing_url = lookup("GUARDIAN_PAIRING_URL").unwrap_or(defaults.pairing_url);
        let provider_marker =
            lookup("GUARDIAN_PROVIDER_MARKER").unwrap_or(defaults.provider_marker);
        let channel_label = lookup("GUARDIAN_DATA_CHANNEL_LABEL").unwrap_or(defaults.channel_label);
        let ice_servers = lookup("GUARDIAN_ICE_SERVERS")
            .map(|v| parse_ice_servers(&v))
            .unwrap_or_default();
        let rpc_timeout = lookup("GUARDIAN_RPC_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.rpc_timeout);
        let connect_timeout = lookup("GUARDIAN_CONNECT_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);
        let log_filter = lookup("RUST_LOG").unwrap_or(defaults.log_filter);
        Self {
            extension_origin,
            pairing_url,
            provider_marker,
            channel_label,
            ice_servers,
            rpc_timeout,
            connect_timeout,
            log_filter,
        }
    }

    /// The only sender allowed to drive negotiation.
    pub fn trusted_ui_url(&self) -> String {
        format!("{}popup.html", self.extension_origin)
    }

    pub fn offscreen_url(&self) -> String {
        format!("{}offscreen.html", self.extension_origin)
    }

    pub fn options_url(&self) -> String {
        format!("{}options.html", self.extension_origin)
    }

    /// Shareable link that carries a complete offer to the signer app.
    pub fn offer_link(&self, sdp: &str) -> String {
        format!("{}#offer={}", self.pairing_url, urlencoding::encode(sdp))
    }
}

pub fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn with_trailing_slash(origin: &str) -> String {
    if origin.ends_with('/') {
        origin.to_string()
    } else {
        format!("{origin}/")
    }
}
