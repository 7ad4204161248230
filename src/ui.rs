//! Interface de terminal do genbatch: spinner de progresso e resumo colorido.
//!
//! Usa as crates `indicatif` para o spinner e `console` para estilização
//! com cores. O [`BatchProgress`] acompanha visualmente o lote no terminal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::CheckpointReport;
use crate::orchestrator::BatchObserver;
use crate::state_machine::JobOutcome;
use crate::summary::BatchSummary;

/// Indicador visual de progresso para a execução de um lote no terminal.
///
/// O total de jobs não é conhecido de antemão, então exibe um spinner com
/// contadores de sucesso (verde), falha (vermelho) e pulados (amarelo).
pub struct BatchProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl BatchProgress {
    /// Inicia o spinner com o nome do arquivo de entrada.
    pub fn start(input: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let template = "{spinner:.cyan} [{elapsed}] {msg}";
        if let Ok(style) = ProgressStyle::default_spinner().template(template) {
            pb.set_style(style);
        }
        pb.set_message(format!("starting {input}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    fn refresh(&self) {
        let palette = Palette::new();
        self.pb.set_message(format!(
            "{} ok  {} failed  {} skipped",
            palette.green.apply_to(self.succeeded.load(Ordering::Relaxed)),
            palette.red.apply_to(self.failed.load(Ordering::Relaxed)),
            palette.yellow.apply_to(self.skipped.load(Ordering::Relaxed)),
        ));
    }

    /// Encerra o spinner antes de imprimir o resumo.
    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl BatchObserver for BatchProgress {
    fn job_finished(&self, _request_id: &str, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Succeeded(_) => &self.succeeded,
            JobOutcome::Failed(_) => &self.failed,
            JobOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.refresh();
    }
}

struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    bold: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            bold: Style::new().bold(),
        }
    }
}

/// Imprime o resumo final do lote; com `verbose`, também em JSON.
pub fn print_summary(summary: &BatchSummary, verbose: bool) {
    let palette = Palette::new();
    let title = if summary.dry_run {
        "Dry run"
    } else if summary.interrupted {
        "Batch interrupted"
    } else {
        "Batch complete"
    };
    let title_style = if summary.interrupted || summary.failed > 0 {
        &palette.yellow
    } else {
        &palette.green
    };

    println!();
    println!("{}", title_style.apply_to(format!("─── {title} ───")));
    println!("  {:<12}{}", "total", palette.bold.apply_to(summary.total));
    if summary.dry_run {
        println!("  {:<12}{}", "planned", palette.green.apply_to(summary.planned));
    } else {
        println!("  {:<12}{}", "succeeded", palette.green.apply_to(summary.succeeded));
        println!("  {:<12}{}", "failed", palette.red.apply_to(summary.failed));
    }
    println!("  {:<12}{}", "skipped", palette.yellow.apply_to(summary.skipped));
    if summary.rejected > 0 {
        println!("  {:<12}{}", "duplicates", palette.yellow.apply_to(summary.rejected));
    }
    println!("  {:<12}{:.1}%", "success", summary.success_rate());
    println!("  {:<12}{:.1}s", "elapsed", summary.elapsed_seconds);
    println!("  {:<12}{}", "checkpoint", summary.checkpoint_path.display());

    if verbose {
        println!();
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }
}

/// Imprime o estado de um checkpoint existente.
pub fn print_report(path: &std::path::Path, report: &CheckpointReport) {
    let palette = Palette::new();
    println!("{}", palette.bold.apply_to(format!("Checkpoint {}", path.display())));
    println!("  {:<12}{}", "entries", report.entries);
    println!("  {:<12}{}", "succeeded", palette.green.apply_to(report.succeeded()));
    println!("  {:<12}{}", "failed", palette.red.apply_to(report.failed()));
    if report.torn_tail {
        println!(
            "  {} final line is incomplete and will be discarded on resume",
            palette.yellow.apply_to("!")
        );
    }
}
