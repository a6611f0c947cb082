//! # Módulo de Agregação de Resultados
//!
//! Junta os resultados de cada step em um resumo único da execução e
//! interpreta relatórios textuais de runners externos.
//!
//! ## Duas fontes de resultado:
//!
//! 1. **Execução direta**: o `ChainExecutor` produz `ChainStepResult`s e
//!    `summarize_run` fecha o `ChainRunSummary`.
//! 2. **Artefato gerado**: quando a cadeia vira um arquivo de testes e roda
//!    num runner externo, o relatório em texto passa por um `ReportParser`.
//!
//! O formato de saída do runner externo não é controlado por nós, então o
//! parser é tolerante: linhas desconhecidas são ignoradas e um relatório
//! sem nada reconhecível vira um resumo zerado, nunca um erro.

use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::ChainError;
use crate::protocol::{ChainRunSummary, ChainStepResult};

// ============================================================================
// RESUMO DA EXECUÇÃO
// ============================================================================

/// Metadados de uma execução, preenchidos pelo executor.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub plan_fingerprint: String,
    pub planned: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunMetadata {
    pub fn new(plan_fingerprint: impl Into<String>, planned: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            plan_fingerprint: plan_fingerprint.into(),
            planned,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }
}

/// Resume uma lista de resultados sem metadados de execução.
///
/// A duração é a soma das durações dos steps.
pub fn summarize(results: Vec<ChainStepResult>) -> ChainRunSummary {
    let mut meta = RunMetadata::new(String::new(), results.len());
    meta.duration_ms = results.iter().map(|r| r.duration_ms).sum();
    summarize_run(results, meta, None)
}

/// Fecha o resumo de uma execução.
///
/// A execução só passa quando todos os steps planejados rodaram e passaram
/// e nenhum erro de escopo de execução ocorreu.
pub fn summarize_run(
    results: Vec<ChainStepResult>,
    meta: RunMetadata,
    run_error: Option<ChainError>,
) -> ChainRunSummary {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed()).count();
    let failed = total - passed;
    let success = failed == 0 && run_error.is_none() && total == meta.planned;

    ChainRunSummary {
        run_id: meta.run_id,
        status: if success { "passed" } else { "failed" }.to_string(),
        plan_fingerprint: meta.plan_fingerprint,
        started_at: meta.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        finished_at: meta.finished_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        planned: meta.planned,
        total,
        passed,
        failed,
        duration_ms: meta.duration_ms,
        steps: results,
        run_error,
    }
}

// ============================================================================
// RELATÓRIO EXTERNO
// ============================================================================

/// Uma falha reportada pelo runner externo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestFailure {
    pub file: Option<String>,
    pub test_name: String,
    pub message: String,
}

/// Resumo recuperado de um relatório textual.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExternalReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub failures: Vec<TestFailure>,
}

impl ExternalReport {
    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.failures.is_empty()
    }

    pub fn failure(&self, test_name: &str) -> Option<&TestFailure> {
        self.failures.iter().find(|f| f.test_name == test_name)
    }
}

/// Interpreta a saída textual de um runner de testes.
pub trait ReportParser {
    fn parse(&self, output: &str) -> ExternalReport;
}

// `FAILED tests/test_chain.py::test_case_1 - AssertionError: 400 != 200`
static SHORT_FAILURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:FAILED|ERROR)\s+(?P<nodeid>\S+)(?:\s+-\s+(?P<reason>.*))?$")
        .expect("valid short failure regex")
});

// `tests/test_chain.py::test_case_1 FAILED [ 50%]`
static VERBOSE_RESULT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<nodeid>\S+)\s+(?P<outcome>PASSED|FAILED|SKIPPED|ERROR|XFAIL|XPASS)\b")
        .expect("valid verbose result regex")
});

// `==== 1 failed, 2 passed, 1 skipped in 0.12s ====`
static SUMMARY_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^=*\s*(?P<counts>\d+\s+\w+(?:,\s*\d+\s+\w+)*)\s+in\s+(?P<secs>[\d.]+)s")
        .expect("valid summary regex")
});

static SUMMARY_COUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<n>\d+)\s+(?P<kind>\w+)").expect("valid count regex"));

/// Parser do relatório de texto do pytest.
///
/// Reconhece o resumo curto (`FAILED <arquivo>::<teste> - <motivo>`), as
/// linhas do modo verboso (`<teste> FAILED`) e a linha final de totais.
/// Quando a linha de totais existe, ela manda nas contagens.
#[derive(Debug, Default, Clone, Copy)]
pub struct PytestReportParser;

impl PytestReportParser {
    fn record_failure(report: &mut ExternalReport, nodeid: &str, reason: Option<&str>) {
        let (file, test_name) = split_nodeid(nodeid);
        let message = reason.unwrap_or_default().trim().to_string();

        match report
            .failures
            .iter_mut()
            .find(|f| f.test_name == test_name && f.file == file)
        {
            Some(existing) => {
                if existing.message.is_empty() {
                    existing.message = message;
                }
            }
            None => report.failures.push(TestFailure {
                file,
                test_name,
                message,
            }),
        }
    }
}

impl ReportParser for PytestReportParser {
    fn parse(&self, output: &str) -> ExternalReport {
        let mut report = ExternalReport::default();
        let mut seen_passed = 0;
        let mut seen_skipped = 0;
        let mut summary_seen = false;

        for line in output.lines().map(str::trim) {
            if let Some(caps) = SHORT_FAILURE_RE.captures(line) {
                let reason = caps.name("reason").map(|m| m.as_str());
                Self::record_failure(&mut report, &caps["nodeid"], reason);
                continue;
            }

            if let Some(caps) = VERBOSE_RESULT_RE.captures(line) {
                match &caps["outcome"] {
                    "FAILED" | "ERROR" => Self::record_failure(&mut report, &caps["nodeid"], None),
                    "PASSED" | "XPASS" => seen_passed += 1,
                    _ => seen_skipped += 1,
                }
                continue;
            }

            if let Some(caps) = SUMMARY_LINE_RE.captures(line) {
                summary_seen = true;
                report.duration_secs = caps["secs"].parse().ok();
                for count in SUMMARY_COUNT_RE.captures_iter(&caps["counts"]) {
                    let n: usize = count["n"].parse().unwrap_or(0);
                    match &count["kind"] {
                        "failed" => report.failed = n,
                        "passed" | "xpassed" => report.passed += n,
                        "skipped" | "xfailed" => report.skipped += n,
                        "error" | "errors" => report.errors = n,
                        _ => {}
                    }
                }
            }
        }

        if !summary_seen {
            report.passed = seen_passed;
            report.skipped = seen_skipped;
            report.failed = report.failures.len();
        }
        report.total = report.passed + report.failed + report.skipped + report.errors;

        tracing::debug!(
            total = report.total,
            failed = report.failed,
            failures = report.failures.len(),
            "Relatório externo interpretado"
        );
        report
    }
}

/// `tests/a.py::Class::test_x[param]` -> (`tests/a.py`, `test_x[param]`).
/// Sem `::`, o id inteiro é o nome do teste.
fn split_nodeid(nodeid: &str) -> (Option<String>, String) {
    match nodeid.split_once("::") {
        Some((file, rest)) => {
            let test = rest.rsplit("::").next().unwrap_or(rest);
            (Some(file.to_string()), test.to_string())
        }
        None => (None, nodeid.to_string()),
    }
}
