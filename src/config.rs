use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::music::subscription::ReconnectPolicy;
use crate::music::volume::VolumePolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Volumen
    pub default_volume: u8,
    pub max_volume: u8,
    pub volume_scale_factor: f32,

    // Reconexión de voz
    pub rejoin_attempt_limit: u32,
    pub rejoin_backoff_secs: u64,
    pub ready_timeout_secs: u64,
    pub kick_probe_secs: u64,

    // Texto a voz
    pub tts_provider: String,
    pub tts_voice: String,

    // APIs opcionales
    pub youtube_api_key: Option<String>,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Volumen
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            max_volume: std::env::var("MAX_VOLUME")
                .unwrap_or_else(|_| "200".to_string())
                .parse()?,
            volume_scale_factor: std::env::var("VOLUME_SCALE_FACTOR")
                .unwrap_or_else(|_| "0.40".to_string())
                .parse()?,

            // Reconexión
            rejoin_attempt_limit: std::env::var("REJOIN_ATTEMPT_LIMIT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            rejoin_backoff_secs: std::env::var("REJOIN_BACKOFF_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            ready_timeout_secs: std::env::var("READY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            kick_probe_secs: std::env::var("KICK_PROBE_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            // Texto a voz
            tts_provider: std::env::var("TTS_PROVIDER")
                .unwrap_or_else(|_| "google".to_string()),
            tts_voice: std::env::var("TTS_VOICE").unwrap_or_else(|_| "es-MX".to_string()),

            // APIs opcionales
            youtube_api_key: std::env::var("YOUTUBE_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Chequeos de sanidad sobre los valores cargados.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > self.max_volume {
            anyhow::bail!(
                "El volumen por defecto ({}) excede el máximo ({})",
                self.default_volume,
                self.max_volume
            );
        }

        if self.volume_scale_factor <= 0.0 || self.volume_scale_factor > 1.0 {
            anyhow::bail!(
                "El factor de escala de volumen debe estar en (0, 1], recibido: {}",
                self.volume_scale_factor
            );
        }

        if self.ready_timeout_secs == 0 {
            anyhow::bail!("El plazo de conexión debe ser mayor a cero");
        }

        if self.kick_probe_secs == 0 {
            anyhow::bail!("El plazo de desambiguación 4014 debe ser mayor a cero");
        }

        Ok(())
    }

    pub fn volume_policy(&self) -> VolumePolicy {
        VolumePolicy {
            scale_factor: self.volume_scale_factor,
            max_human: self.max_volume,
            default_human: self.default_volume,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            rejoin_attempt_limit: self.rejoin_attempt_limit,
            rejoin_backoff: Duration::from_secs(self.rejoin_backoff_secs),
            ready_deadline: Duration::from_secs(self.ready_timeout_secs),
            kick_probe: Duration::from_secs(self.kick_probe_secs),
        }
    }

    /// Resumen apto para logs: sin token ni claves.
    pub fn summary(&self) -> String {
        format!(
            "Config:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Volumen: {}% por defecto, {}% máximo, escala {}\n  \
            Reconexión: {} intentos, {}s base, {}s plazo Ready\n  \
            TTS: {} / {}\n  \
            Autoplay: {}",
            self.application_id,
            self.guild_id
                .map_or("global".to_string(), |id| id.to_string()),
            self.default_volume,
            self.max_volume,
            self.volume_scale_factor,
            self.rejoin_attempt_limit,
            self.rejoin_backoff_secs,
            self.ready_timeout_secs,
            self.tts_provider,
            self.tts_voice,
            if self.youtube_api_key.is_some() {
                "habilitado"
            } else {
                "sin clave de API"
            }
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin defaults, deben proveerse)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            // Volumen
            default_volume: 50,
            max_volume: 200,
            volume_scale_factor: 0.40,

            // Reconexión
            rejoin_attempt_limit: 5,
            rejoin_backoff_secs: 5,
            ready_timeout_secs: 20,
            kick_probe_secs: 5,

            // Texto a voz
            tts_provider: "google".to_string(),
            tts_voice: "es-MX".to_string(),

            youtube_api_key: None,

            data_dir: "/app/data".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_volume() {
        let config = Config {
            default_volume: 250,
            max_volume: 200,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            volume_scale_factor: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policies_mirror_config_values() {
        let config = Config {
            default_volume: 80,
            max_volume: 150,
            rejoin_attempt_limit: 3,
            rejoin_backoff_secs: 2,
            ..Config::default()
        };

        let volume = config.volume_policy();
        assert_eq!(volume.default_human, 80);
        assert_eq!(volume.max_human, 150);

        let reconnect = config.reconnect_policy();
        assert_eq!(reconnect.rejoin_attempt_limit, 3);
        assert_eq!(reconnect.rejoin_backoff, Duration::from_secs(2));
    }
}
