//! Extension pour intégrer le relais HLS dans pmoconfig
//!
//! Ce module fournit le trait `HlsRelayConfigExt` qui ajoute à
//! `pmoconfig::Config` les réglages du relais (flux d'origine, session,
//! timeouts, ICY, métadonnées).
//!
//! # Auto-persist des valeurs par défaut
//!
//! Les getters écrivent la valeur par défaut dans la configuration la
//! première fois qu'elle est lue, pour que `config.yaml` documente tous les
//! réglages disponibles.
//!
//! # Exemple
//!
//! ```no_run
//! use pmoconfig::Config;
//! use pmohlsrelay::{HlsRelayConfigExt, RelaySettings};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load_config("")?;
//! println!("Relaying {}", config.get_relay_stream_url()?);
//!
//! let settings = RelaySettings::from_config(&config)?;
//! println!("ICY interval: {} bytes", settings.icy_metaint);
//! # Ok(())
//! # }
//! ```

use crate::client::{
    DEFAULT_MAX_RETRIES, DEFAULT_READ_IDLE_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_USER_AGENT,
};
use crate::icy::{DEFAULT_LIVE_EDGE_SEGMENTS, DEFAULT_METAINT};
use crate::nowplaying::DEFAULT_POLL_INTERVAL_SECS;
use crate::service::{RelaySettings, DEFAULT_STATION_GENRE, DEFAULT_STATION_NAME, DEFAULT_STREAM_URL};
use crate::session::{DEFAULT_SESSION_GRACE_SECS, DEFAULT_SESSION_TTL_SECS};
use anyhow::{anyhow, Result};
use pmoconfig::Config;
use serde_yaml::Value;
use std::time::Duration;
use url::Url;

/// Trait d'extension pour la configuration du relais HLS
pub trait HlsRelayConfigExt {
    // ========================================================================
    // Origin
    // ========================================================================

    /// URL du flux HLS d'origine (playlist maître ou média)
    fn get_relay_stream_url(&self) -> Result<String>;

    /// Change l'URL du flux d'origine
    fn set_relay_stream_url(&self, url: &str) -> Result<()>;

    /// Nom de la station (icy-name, playlists M3U)
    fn get_relay_station_name(&self) -> Result<String>;

    fn set_relay_station_name(&self, name: &str) -> Result<()>;

    /// Genre annoncé dans `icy-genre`
    fn get_relay_station_genre(&self) -> Result<String>;

    /// User-Agent envoyé à l'origine
    fn get_relay_user_agent(&self) -> Result<String>;

    // ========================================================================
    // Session & timeouts
    // ========================================================================

    /// Durée de vie d'une session avant rafraîchissement (secondes)
    fn get_relay_session_ttl_secs(&self) -> Result<u64>;

    /// Durée pendant laquelle une session expirée reste utilisable si le
    /// rafraîchissement échoue (secondes)
    fn get_relay_session_grace_secs(&self) -> Result<u64>;

    fn get_relay_request_timeout_secs(&self) -> Result<u64>;

    fn get_relay_read_idle_timeout_secs(&self) -> Result<u64>;

    fn get_relay_max_retries(&self) -> Result<u64>;

    fn get_relay_retry_base_delay_ms(&self) -> Result<u64>;

    // ========================================================================
    // ICY
    // ========================================================================

    /// Intervalle entre deux blocs de métadonnées ICY (octets)
    fn get_relay_icy_metaint(&self) -> Result<u64>;

    fn set_relay_icy_metaint(&self, metaint: u64) -> Result<()>;

    /// Nombre de segments derrière le direct au démarrage d'un client
    fn get_relay_live_edge_segments(&self) -> Result<u64>;

    // ========================================================================
    // Now playing
    // ========================================================================

    fn get_nowplaying_poll_interval_secs(&self) -> Result<u64>;

    /// Source JSON optionnelle ; `None` = extraction depuis la playlist
    fn get_nowplaying_source_url(&self) -> Result<Option<String>>;
}

impl HlsRelayConfigExt for Config {
    fn get_relay_stream_url(&self) -> Result<String> {
        self.get_string_or(&["relay", "stream_url"], DEFAULT_STREAM_URL)
    }

    fn set_relay_stream_url(&self, url: &str) -> Result<()> {
        Url::parse(url).map_err(|e| anyhow!("invalid stream URL {}: {}", url, e))?;
        self.set_value(&["relay", "stream_url"], Value::String(url.to_string()))
    }

    fn get_relay_station_name(&self) -> Result<String> {
        self.get_string_or(&["relay", "station_name"], DEFAULT_STATION_NAME)
    }

    fn set_relay_station_name(&self, name: &str) -> Result<()> {
        self.set_value(&["relay", "station_name"], Value::String(name.to_string()))
    }

    fn get_relay_station_genre(&self) -> Result<String> {
        self.get_string_or(&["relay", "station_genre"], DEFAULT_STATION_GENRE)
    }

    fn get_relay_user_agent(&self) -> Result<String> {
        self.get_string_or(&["relay", "user_agent"], DEFAULT_USER_AGENT)
    }

    fn get_relay_session_ttl_secs(&self) -> Result<u64> {
        self.get_u64_or(&["relay", "session_ttl_secs"], DEFAULT_SESSION_TTL_SECS)
    }

    fn get_relay_session_grace_secs(&self) -> Result<u64> {
        self.get_u64_or(&["relay", "session_grace_secs"], DEFAULT_SESSION_GRACE_SECS)
    }

    fn get_relay_request_timeout_secs(&self) -> Result<u64> {
        self.get_u64_or(&["relay", "request_timeout_secs"], DEFAULT_REQUEST_TIMEOUT_SECS)
    }

    fn get_relay_read_idle_timeout_secs(&self) -> Result<u64> {
        self.get_u64_or(
            &["relay", "read_idle_timeout_secs"],
            DEFAULT_READ_IDLE_TIMEOUT_SECS,
        )
    }

    fn get_relay_max_retries(&self) -> Result<u64> {
        self.get_u64_or(&["relay", "max_retries"], DEFAULT_MAX_RETRIES as u64)
    }

    fn get_relay_retry_base_delay_ms(&self) -> Result<u64> {
        self.get_u64_or(&["relay", "retry_base_delay_ms"], DEFAULT_RETRY_BASE_DELAY_MS)
    }

    fn get_relay_icy_metaint(&self) -> Result<u64> {
        let metaint = self.get_u64_or(&["relay", "icy_metaint"], DEFAULT_METAINT as u64)?;
        if metaint == 0 {
            // 0 would mean a metadata block after every byte
            self.set_relay_icy_metaint(DEFAULT_METAINT as u64)?;
            return Ok(DEFAULT_METAINT as u64);
        }
        Ok(metaint)
    }

    fn set_relay_icy_metaint(&self, metaint: u64) -> Result<()> {
        self.set_value(
            &["relay", "icy_metaint"],
            Value::Number(serde_yaml::Number::from(metaint)),
        )
    }

    fn get_relay_live_edge_segments(&self) -> Result<u64> {
        self.get_u64_or(
            &["relay", "live_edge_segments"],
            DEFAULT_LIVE_EDGE_SEGMENTS as u64,
        )
    }

    fn get_nowplaying_poll_interval_secs(&self) -> Result<u64> {
        self.get_u64_or(&["nowplaying", "poll_interval_secs"], DEFAULT_POLL_INTERVAL_SECS)
    }

    fn get_nowplaying_source_url(&self) -> Result<Option<String>> {
        let url = self.get_string_or(&["nowplaying", "source_url"], "")?;
        Ok(Some(url.trim().to_string()).filter(|u| !u.is_empty()))
    }
}

impl RelaySettings {
    /// Instantané des réglages du relais lus depuis la configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let stream_url = config.get_relay_stream_url()?;
        let stream_url =
            Url::parse(&stream_url).map_err(|e| anyhow!("invalid relay.stream_url {}: {}", stream_url, e))?;

        let metadata_url = match config.get_nowplaying_source_url()? {
            Some(url) => Some(
                Url::parse(&url).map_err(|e| anyhow!("invalid nowplaying.source_url {}: {}", url, e))?,
            ),
            None => None,
        };

        Ok(Self {
            stream_url,
            station_name: config.get_relay_station_name()?,
            station_genre: config.get_relay_station_genre()?,
            user_agent: config.get_relay_user_agent()?,
            session_ttl: Duration::from_secs(config.get_relay_session_ttl_secs()?),
            session_grace: Duration::from_secs(config.get_relay_session_grace_secs()?),
            request_timeout: Duration::from_secs(config.get_relay_request_timeout_secs()?),
            read_idle_timeout: Duration::from_secs(config.get_relay_read_idle_timeout_secs()?),
            max_retries: config.get_relay_max_retries()?.min(u32::MAX as u64) as u32,
            retry_base_delay: Duration::from_millis(config.get_relay_retry_base_delay_ms()?),
            icy_metaint: config.get_relay_icy_metaint()? as usize,
            live_edge_segments: config.get_relay_live_edge_segments()?.max(1) as usize,
            poll_interval: Duration::from_secs(config.get_nowplaying_poll_interval_secs()?.max(1)),
            metadata_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_persisted() {
        let config = Config::in_memory("").unwrap();
        assert!(config.get_value(&["relay", "session_ttl_secs"]).is_err());

        assert_eq!(config.get_relay_session_ttl_secs().unwrap(), DEFAULT_SESSION_TTL_SECS);
        assert!(config.get_value(&["relay", "session_ttl_secs"]).is_ok());
        assert_eq!(config.get_relay_icy_metaint().unwrap(), DEFAULT_METAINT as u64);
        assert_eq!(config.get_nowplaying_source_url().unwrap(), None);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::in_memory(
            "relay:\n  stream_url: http://origin.test/live/playlist.m3u8\n  station_name: Test FM\n  icy_metaint: 8192\n  max_retries: 1\nnowplaying:\n  source_url: http://meta.test/now.json\n",
        )
        .unwrap();

        let settings = RelaySettings::from_config(&config).unwrap();
        assert_eq!(settings.stream_url.as_str(), "http://origin.test/live/playlist.m3u8");
        assert_eq!(settings.station_name, "Test FM");
        assert_eq!(settings.icy_metaint, 8192);
        assert_eq!(settings.max_retries, 1);
        assert_eq!(
            settings.metadata_url.as_ref().map(Url::as_str),
            Some("http://meta.test/now.json")
        );
    }

    #[test]
    fn test_invalid_values() {
        let config = Config::in_memory("relay:\n  icy_metaint: 0\n").unwrap();
        assert_eq!(config.get_relay_icy_metaint().unwrap(), DEFAULT_METAINT as u64);

        assert!(config.set_relay_stream_url("not a url").is_err());

        let config = Config::in_memory("relay:\n  stream_url: '::nope'\n").unwrap();
        assert!(RelaySettings::from_config(&config).is_err());
    }
}
