use aidgent_core::bundle::PolicyBundle;
use aidgent_core::config::{AppConfig, LoadOptions};
use aidgent_db::{connect_with_config, migrations};
use serde::Serialize;

use crate::commands::{block_on, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass(
                "config_validation",
                "configuration loaded and validated",
            ));
            checks.push(check_policy_bundle(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            let reason = "configuration did not load";
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.push(DoctorCheck::skipped("policy_bundle", reason));
            checks.push(DoctorCheck::skipped("database_connectivity", reason));
            checks.push(DoctorCheck::skipped("database_migrations", reason));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_policy_bundle(config: &AppConfig) -> DoctorCheck {
    let bundle = match PolicyBundle::load(&config.policy) {
        Ok(bundle) => bundle,
        Err(error) => return DoctorCheck::fail("policy_bundle", error.to_string()),
    };

    let report = bundle.slots.report();
    let mut details = format!(
        "{} intent(s), {} red-flag rule(s) from `{}`",
        bundle.slots.policy.intents.len(),
        bundle.safety.red_flags.len(),
        config.policy.dir.display()
    );
    if !report.is_clean() {
        details.push_str(&format!(
            "; {} unparseable predicate(s), {} question(s) for unknown slots",
            report.unparseable_predicates.len(),
            report.unknown_question_targets.len()
        ));
    }

    DoctorCheck::pass("policy_bundle", details)
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let result = block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let pending = migrations::pending_versions(&pool).await;
        pool.close().await;
        Ok::<_, String>(pending)
    });

    let pending = match result {
        Ok(Ok(pending)) => pending,
        Ok(Err(error)) => {
            return vec![
                DoctorCheck::fail("database_connectivity", error),
                DoctorCheck::skipped("database_migrations", "the database is unreachable"),
            ];
        }
        Err(error) => {
            return vec![
                DoctorCheck::fail("database_connectivity", format!("{error:#}")),
                DoctorCheck::skipped("database_migrations", "the async runtime did not start"),
            ];
        }
    };

    let connectivity = DoctorCheck::pass(
        "database_connectivity",
        format!("connected using `{}`", config.database.url),
    );
    let schema = match pending {
        Ok(pending) if pending.is_empty() => {
            DoctorCheck::pass("database_migrations", "schema is up to date")
        }
        Ok(pending) => DoctorCheck::fail(
            "database_migrations",
            format!("{} pending migration(s) {pending:?}; run `aidgent migrate`", pending.len()),
        ),
        Err(error) => DoctorCheck::fail(
            "database_migrations",
            format!("could not read migration history: {error}"),
        ),
    };

    vec![connectivity, schema]
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
