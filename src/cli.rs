//! Interface de linha de comando do genbatch baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status)
//! e flags globais (--config, --max-retries, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use genbatch::input::InputFormat;

/// genbatch: executor de lotes de geração com limite de taxa e retomada.
#[derive(Debug, Parser)]
#[command(name = "genbatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: ./genbatch.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número máximo de retentativas em caso de falha.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa todos os jobs de um arquivo CSV ou JSONL.
    Run(RunArgs),

    /// Mostra o estado do checkpoint de um diretório de saída.
    Status {
        /// Diretório de saída que contém o checkpoint.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Arquivo CSV ou JSONL com um job por linha.
    pub input: PathBuf,

    /// Formato do arquivo de entrada (padrão: detectado pela extensão ou conteúdo).
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// Diretório onde artefatos e o checkpoint são gravados.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Jobs em execução simultânea (1 a 50).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Requisições por minuto (1 a 300).
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// Capacidade de rajada do limitador de taxa.
    #[arg(long = "burst")]
    pub burst_capacity: Option<u32>,

    /// Pula jobs já concluídos com sucesso no checkpoint existente.
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    /// Lista o que seria executado sem chamar o serviço.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// URL do serviço de geração.
    #[arg(long)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Csv,
    Jsonl,
}

impl From<FormatArg> for InputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => InputFormat::Csv,
            FormatArg::Jsonl => InputFormat::Jsonl,
        }
    }
}
