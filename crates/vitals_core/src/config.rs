//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável; seções ausentes usam o
//! valor padrão.

use crate::history::DEFAULT_HISTORY_SIZE;
use crate::transport::DEFAULT_BAUD_RATE;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Nome do arquivo de configuração da estação.
pub const CONFIG_FILE: &str = "config.toml";

/// Erros ao gravar configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro de serialização TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro de E/S em {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Porta serial do dispositivo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Nome da porta (vazio = perguntar / primeira disponível)
    pub port: String,
    /// Baud rate do firmware
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Parâmetros do pipeline de leituras.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Leituras mantidas para exibição
    pub history_capacity: usize,
    /// Intervalo mínimo entre envios ao backend (ms)
    pub forward_interval_ms: u64,
    /// Tamanho da fila da thread de envio
    pub forward_queue: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_SIZE,
            forward_interval_ms: 1000,
            forward_queue: 8,
        }
    }
}

impl PipelineConfig {
    pub fn forward_interval(&self) -> Duration {
        Duration::from_millis(self.forward_interval_ms)
    }
}

/// Backend de sessões.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// URL base da API (sem `/sessions`)
    pub base_url: String,
    /// Timeout por requisição (segundos)
    pub timeout_secs: u64,
    /// Token bearer (vazio = sem autenticação)
    pub token: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            timeout_secs: 10,
            token: String::new(),
        }
    }
}

/// Configuração raiz do aplicativo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    /// Lê o `config.toml` da estação. Arquivo ausente ou inválido cai nos
    /// padrões (porta perguntada, 115200 baud, backend local).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => {
                    info!(
                        "Estação configurada por {} (porta '{}', backend {})",
                        path.display(),
                        config.serial.port,
                        config.store.base_url
                    );
                    return config;
                }
                Err(e) => warn!("{} inválido, ignorando: {e}", path.display()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} não existe", path.display());
            }
            Err(e) => warn!("Não foi possível ler {}: {e}", path.display()),
        }

        info!("Estação com configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração da estação gravada em {}", path.display());
        Ok(())
    }

    /// `config.toml` no diretório do executável (ou no diretório atual).
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_FILE)
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.serial.baud_rate == 0 {
            errors.push("Baud rate não pode ser 0".into());
        }
        if self.pipeline.history_capacity == 0 {
            errors.push("Capacidade do histórico não pode ser 0".into());
        }
        if self.pipeline.forward_interval_ms < 100 || self.pipeline.forward_interval_ms > 60_000 {
            errors.push(format!(
                "Intervalo de envio inválido: {}ms (100–60000)",
                self.pipeline.forward_interval_ms
            ));
        }
        if self.pipeline.forward_queue == 0 {
            errors.push("Fila de envio não pode ser 0".into());
        }
        if !self.store.base_url.starts_with("http://") && !self.store.base_url.starts_with("https://") {
            errors.push(format!("URL do backend inválida: {}", self.store.base_url));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        let errors = config.validate();
        assert!(errors.is_empty(), "Erros: {:?}", errors);
    }

    #[test]
    fn roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.serial.baud_rate, parsed.serial.baud_rate);
        assert_eq!(config.store.base_url, parsed.store.base_url);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let partial = r#"
[serial]
port = "/dev/ttyACM0"
"#;
        let config: AppConfig = toml::from_str(partial).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        // Outros campos devem ter valor padrão
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.pipeline.history_capacity, 200);
        assert_eq!(config.pipeline.forward_interval(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut config = AppConfig::default();
        config.serial.baud_rate = 0;
        config.pipeline.forward_interval_ms = 5;
        config.store.base_url = "localhost".into();
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.serial.port = "COM7".into();
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path);
        assert_eq!(loaded.serial.port, "COM7");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load(&dir.path().join(CONFIG_FILE));
        assert_eq!(loaded.serial.port, "");
        assert_eq!(loaded.store.base_url, "http://localhost:3000");
    }

    #[test]
    fn default_path_points_at_config_file() {
        assert!(AppConfig::default_path().ends_with(CONFIG_FILE));
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "serial = [not toml").unwrap();

        let loaded = AppConfig::load(&path);
        assert_eq!(loaded.serial.baud_rate, DEFAULT_BAUD_RATE);
    }
}
