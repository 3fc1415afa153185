use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

/// Configuración por servidor almacenada en JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub guild_id: u64,
    /// Volumen humano (0–200) con el que arranca cada suscripción.
    pub default_volume: u8,
    pub tts_voice: Option<String>,
    pub dj_role_id: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            default_volume: 50,
            tts_voice: None,
            dj_role_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Almacenamiento basado en archivos JSON, un archivo por guild.
pub struct JsonStorage {
    data_dir: PathBuf,
    servers_cache: HashMap<u64, ServerConfig>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).await?;
        fs::create_dir_all(data_dir.join("servers")).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let mut storage = Self {
            data_dir,
            servers_cache: HashMap::new(),
        };
        storage.load_all_servers().await?;

        Ok(storage)
    }

    /// Configuración del servidor; la crea con defaults si no existe.
    pub async fn get_server_config(&mut self, guild_id: u64) -> Result<ServerConfig> {
        if let Some(config) = self.servers_cache.get(&guild_id) {
            return Ok(config.clone());
        }

        match self.load_server_config(guild_id).await {
            Ok(config) => {
                self.servers_cache.insert(guild_id, config.clone());
                Ok(config)
            }
            Err(_) => {
                let config = ServerConfig {
                    guild_id,
                    ..ServerConfig::default()
                };
                self.save_server_config(&config).await?;
                self.servers_cache.insert(guild_id, config.clone());

                info!("📝 Configuración por defecto creada para guild {guild_id}");
                Ok(config)
            }
        }
    }

    pub async fn update_server_config(&mut self, mut config: ServerConfig) -> Result<()> {
        config.updated_at = Utc::now();
        let guild_id = config.guild_id;
        self.servers_cache.insert(guild_id, config.clone());
        self.save_server_config(&config).await?;

        info!("💾 Configuración actualizada para guild {guild_id}");
        Ok(())
    }

    pub async fn set_default_volume(&mut self, guild_id: u64, volume: u8) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.default_volume = volume.min(200);
        self.update_server_config(config).await
    }

    /// Borra la configuración persistida de un guild (archivo y caché).
    #[allow(dead_code)]
    pub async fn remove_server_config(&mut self, guild_id: u64) -> Result<()> {
        self.servers_cache.remove(&guild_id);
        match fs::remove_file(self.server_file_path(guild_id)).await {
            Ok(()) => info!("🗑️ Configuración eliminada para guild {guild_id}"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    async fn load_server_config(&self, guild_id: u64) -> Result<ServerConfig> {
        let content = fs::read_to_string(self.server_file_path(guild_id)).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save_server_config(&self, config: &ServerConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        fs::write(self.server_file_path(config.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_servers(&mut self) -> Result<()> {
        let servers_dir = self.data_dir.join("servers");
        let mut files = fs::read_dir(&servers_dir).await?;
        let mut loaded = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(guild_id) = stem
                .strip_prefix("guild_")
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_server_config(guild_id).await {
                Ok(config) => {
                    self.servers_cache.insert(guild_id, config);
                    loaded += 1;
                }
                Err(error) => {
                    warn!("Error cargando configuración para guild {guild_id}: {error}");
                }
            }
        }

        if loaded > 0 {
            info!("📂 Cargadas {loaded} configuraciones de servidor");
        }

        Ok(())
    }

    fn server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("servers")
            .join(format!("guild_{guild_id}.json"))
    }
}
