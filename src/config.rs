//! Configuração do genbatch carregada a partir de `genbatch.toml`.
//!
//! A struct [`GenbatchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `GENBATCH_ENDPOINT` tem precedência sobre o arquivo.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BatchError;
use crate::orchestrator::BatchSettings;
use crate::retry::RetryPolicy;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE_NAME: &str = "genbatch.toml";

const CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=50;
const RATE_LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=300;

/// Configuração de nível superior carregada de `genbatch.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenbatchConfig {
    /// Diretório onde artefatos e o checkpoint são gravados.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Número máximo de jobs em execução simultânea.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Requisições por minuto enviadas ao serviço.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Tokens disponíveis de imediato; `rate_limit / 10` quando ausente.
    #[serde(default)]
    pub burst_capacity: Option<u32>,

    /// Máximo de retentativas antes de marcar um job como falho.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso entre tentativas, em milissegundos.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// URL do serviço de geração.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Tempo máximo de cada chamada ao serviço, em segundos.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_concurrency() -> usize {
    10
}

fn default_rate_limit() -> u32 {
    60
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for GenbatchConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            concurrency: default_concurrency(),
            rate_limit: default_rate_limit(),
            burst_capacity: None,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl GenbatchConfig {
    /// Carrega a configuração de `path`, ou de `genbatch.toml` no diretório
    /// atual quando nenhum caminho é dado.
    ///
    /// Usa valores padrão se o arquivo implícito não existir; um caminho
    /// explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self, BatchError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE_NAME).exists() => {
                Self::from_file(Path::new(CONFIG_FILE_NAME))?
            }
            None => Self::default(),
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para o endpoint.
        if let Ok(endpoint) = std::env::var("GENBATCH_ENDPOINT")
            && !endpoint.is_empty()
        {
            config.endpoint = Some(endpoint);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, BatchError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BatchError::Config(format!("cannot read {}: {e}", path.display())))?;
        Ok(toml::from_str::<GenbatchConfig>(&contents)?)
    }

    /// Rejeita valores fora dos limites suportados.
    pub fn validate(&self) -> Result<(), BatchError> {
        if !CONCURRENCY_RANGE.contains(&self.concurrency) {
            return Err(BatchError::Config(format!(
                "concurrency must be between {} and {}, got {}",
                CONCURRENCY_RANGE.start(),
                CONCURRENCY_RANGE.end(),
                self.concurrency
            )));
        }
        if !RATE_LIMIT_RANGE.contains(&self.rate_limit) {
            return Err(BatchError::Config(format!(
                "rate_limit must be between {} and {} per minute, got {}",
                RATE_LIMIT_RANGE.start(),
                RATE_LIMIT_RANGE.end(),
                self.rate_limit
            )));
        }
        if self.burst_capacity == Some(0) {
            return Err(BatchError::Config("burst_capacity must be at least 1".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(BatchError::Config(
                "max_delay_ms must not be smaller than base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parâmetros do orquestrador derivados desta configuração.
    pub fn batch_settings(&self, resume: bool, dry_run: bool) -> BatchSettings {
        BatchSettings {
            output_dir: self.output_dir.clone(),
            concurrency: self.concurrency,
            rate_limit: self.rate_limit,
            burst_capacity: self.burst_capacity,
            resume,
            dry_run,
            retry: self.retry_policy(),
        }
    }
}
