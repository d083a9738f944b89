use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::{ice, Error as WebrtcError};

const DEFAULT_STUN_FALLBACKS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Http {
    pub host: String,
    pub port: u16,
}

impl Http {
    pub fn listen(&self) -> anyhow::Result<SocketAddr> {
        Ok(SocketAddr::from_str(&format!("{}:{}", self.host, self.port))?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

// Validation mirrors webrtc-rs's own RTCIceServer::urls() / validate().
impl IceServer {
    fn parse_url(&self, url_str: &str) -> webrtc::error::Result<ice::url::Url> {
        ice::url::Url::parse_url(url_str)
    }

    pub fn validate(&self) -> webrtc::error::Result<()> {
        self.urls()?;
        Ok(())
    }

    pub fn urls(&self) -> webrtc::error::Result<Vec<ice::url::Url>> {
        let mut urls = vec![];
        for url_str in &self.urls {
            let mut url = self.parse_url(url_str)?;
            if url.scheme == ice::url::SchemeType::Turn || url.scheme == ice::url::SchemeType::Turns {
                if self.username.is_empty() || self.credential.is_empty() {
                    return Err(WebrtcError::ErrNoTurnCredentials);
                }
                url.username.clone_from(&self.username);
            }
            urls.push(url);
        }
        Ok(urls)
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(val: IceServer) -> Self {
        RTCIceServer {
            urls: val.urls,
            username: val.username,
            credential: val.credential,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub http: Http,
    pub ice_servers: Vec<IceServer>,
    pub log_level: String,
    pub video_fps: u32,
    pub rtsp_url: Option<String>,
    pub allowed_origins: Vec<String>,
    pub transcoder_binary: String,
    /// Not named in spec.md's config table, which only states the broker's
    /// *bind* address; the publisher process needs a reachable URL to dial
    /// that same broker. Defaults to loopback on the configured port.
    pub signaling_ws_url: String,
}

impl Config {
    /// Loads configuration from the environment, applies defaults and the
    /// single-ICE-server STUN-fallback rule, then validates. On any error
    /// the caller should log and exit non-zero per the startup-error
    /// contract.
    pub fn from_env() -> anyhow::Result<Self> {
        let http = Http {
            host: env::var("SIGNALING_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SIGNALING_SERVER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        };

        let username = env::var("ICE_SERVER_USERNAME").unwrap_or_default();
        let credential = env::var("ICE_SERVER_CREDENTIAL").unwrap_or_default();

        let mut raw_urls: Vec<String> = env::var("ICE_SERVER_URLS")
            .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if raw_urls.len() == 1 {
            for fallback in DEFAULT_STUN_FALLBACKS {
                if !raw_urls.iter().any(|u| u == fallback) {
                    raw_urls.push(fallback.to_string());
                }
            }
        }

        let ice_servers = vec![IceServer {
            urls: raw_urls,
            username,
            credential,
        }];

        let video_fps = env::var("VIDEO_FPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let rtsp_url = env::var("RTSP_URL").ok().filter(|s| !s.is_empty());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

        let transcoder_binary = env::var("TRANSCODER_BINARY").unwrap_or_else(|_| "ffmpeg".to_string());

        let signaling_ws_url = env::var("PUBLISHER_SIGNALING_URL")
            .unwrap_or_else(|_| format!("ws://127.0.0.1:{}/ws", http.port));

        let cfg = Config {
            http,
            ice_servers,
            log_level,
            video_fps,
            rtsp_url,
            allowed_origins,
            transcoder_binary,
            signaling_ws_url,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.http
            .listen()
            .map_err(|e| anyhow::anyhow!("invalid SIGNALING_SERVER_HOST/PORT: {e}"))?;
        for ice_server in &self.ice_servers {
            ice_server
                .validate()
                .map_err(|e| anyhow::anyhow!("ice_server error: {e}"))?;
        }
        if self.video_fps == 0 {
            anyhow::bail!("VIDEO_FPS must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_ice_url_gets_stun_fallbacks_appended() {
        std::env::set_var("ICE_SERVER_URLS", "turn:turn.example.com:3478");
        std::env::set_var("ICE_SERVER_USERNAME", "u");
        std::env::set_var("ICE_SERVER_CREDENTIAL", "p");
        let cfg = Config::from_env().expect("config loads");
        assert_eq!(cfg.ice_servers.len(), 1);
        assert_eq!(cfg.ice_servers[0].urls.len(), 4);
        std::env::remove_var("ICE_SERVER_URLS");
        std::env::remove_var("ICE_SERVER_USERNAME");
        std::env::remove_var("ICE_SERVER_CREDENTIAL");
    }

    #[test]
    fn turn_url_without_credentials_fails_validation() {
        let ice = IceServer {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: "".to_string(),
            credential: "".to_string(),
        };
        assert!(ice.validate().is_err());
    }
}
