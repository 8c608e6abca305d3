use ::webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_CHANNEL_LABEL: &str = "chat";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Configuration for WebRTC peer links
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Data channel label
    pub channel_label: String,
    /// Whether the data channel should be ordered
    pub ordered: bool,
    /// Gather loopback candidates (same-host testing)
    pub include_loopback: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ordered: true,
            include_loopback: false,
        }
    }
}

impl WebRtcConfig {
    /// Localhost-only configuration (no STUN/TURN, loopback candidates on)
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            include_loopback: true,
            ..Default::default()
        }
    }

    /// Replaces the ICE server list with entries parsed by [`parse_ice_servers`].
    /// An empty list keeps the defaults.
    pub fn with_ice_servers(mut self, list: &str) -> Self {
        let servers = parse_ice_servers(list);
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
        self
    }
}

/// Parses a comma separated ICE server list. Each entry is either a bare URL
/// (`stun:host:port`) or `username:credential@turn:host:port` for TURN.
pub fn parse_ice_servers(list: &str) -> Vec<RTCIceServer> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match split_credentials(entry) {
            Some((username, credential, url)) => RTCIceServer {
                urls: vec![url.to_string()],
                username: username.to_string(),
                credential: credential.to_string(),
                ..Default::default()
            },
            None => RTCIceServer {
                urls: vec![entry.to_string()],
                ..Default::default()
            },
        })
        .collect()
}

fn split_credentials(entry: &str) -> Option<(&str, &str, &str)> {
    let (auth, url) = entry.rsplit_once('@')?;
    if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
        return None;
    }
    let (username, credential) = auth.split_once(':')?;
    Some((username, credential, url))
}
