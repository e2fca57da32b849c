//! Operator-facing run reports
//!
//! A failed run prints the workflow, the stage it reached, the error, the
//! tail of the proxy logs and, where one applies, a canned remediation hint.

use chrono::Utc;

use crate::orchestrator::{RunOutcome, RunReport, StatusReport};

/// Multi-line report for a run that did not succeed
pub fn render_failure(report: &RunReport) -> String {
    let mut lines = Vec::new();
    let run = report.run_id.short();

    let error = match report.outcome {
        RunOutcome::Succeeded => return render_summary(report),
        RunOutcome::Degraded(ref error) => {
            lines.push(format!(
                "certpilot {} degraded: certificate installed but the proxy is not healthy (run {})",
                report.workflow, run
            ));
            error
        }
        RunOutcome::Failed { stage, ref error } => {
            lines.push(format!(
                "certpilot {} failed at stage {} (run {})",
                report.workflow, stage, run
            ));
            error
        }
    };

    lines.push(format!("error: {}", error));
    for note in &report.notes {
        lines.push(format!("note: {}", note));
    }
    if let Some(hint) = error.hint() {
        lines.push(format!("hint: {}", hint.text()));
    }

    lines.push(String::new());
    if report.proxy_logs.is_empty() {
        lines.push("proxy logs: (none)".to_string());
    } else {
        lines.push(format!("proxy logs (last {} lines):", report.proxy_logs.len()));
        lines.extend(report.proxy_logs.iter().map(|l| format!("  | {}", l)));
    }

    lines.join("\n")
}

/// Short report for a successful run
pub fn render_summary(report: &RunReport) -> String {
    let mut lines = vec![format!(
        "certpilot {} succeeded in {:.1}s (run {})",
        report.workflow,
        report.elapsed.as_secs_f64(),
        report.run_id.short()
    )];

    if let Some(ref preflight) = report.preflight {
        let comparison = match preflight.ip_matches() {
            Some(true) => " (matches this server's public IP)".to_string(),
            Some(false) => format!(" (public IP is {})", preflight.public.map(|ip| ip.to_string()).unwrap_or_default()),
            None => String::new(),
        };
        lines.push(format!(
            "  dns: {} resolves to {}{}",
            preflight.domain, preflight.resolved, comparison
        ));
    }
    if let Some(ref probe) = report.probe {
        lines.push(format!(
            "  challenge: {} served after {} attempt(s)",
            probe.url, probe.attempts
        ));
    }

    let now = Utc::now();
    if let Some(ref before) = report.bundle_before {
        lines.push(format!(
            "  certificate before: expires {} ({} days)",
            before.not_after.format("%Y-%m-%d"),
            before.days_remaining(now)
        ));
    }
    if let Some(ref bundle) = report.bundle {
        lines.push(format!(
            "  certificate: expires {} ({} days)",
            bundle.not_after.format("%Y-%m-%d"),
            bundle.days_remaining(now)
        ));
    }
    for note in &report.notes {
        lines.push(format!("  note: {}", note));
    }

    lines.join("\n")
}

/// Human-readable `status` output
pub fn render_status(status: &StatusReport) -> String {
    let mut lines = vec![
        format!("config dir:    {}", status.config_dir.display()),
        format!("active config: {}", status.active),
        format!(
            "backup:        {}",
            if status.backup_present { "present" } else { "none" }
        ),
    ];

    match (&status.domain, &status.certificate, &status.certificate_error) {
        (None, _, _) => lines.push("certificate:   (no domain configured)".to_string()),
        (Some(_), _, Some(error)) => lines.push(format!("certificate:   unreadable: {}", error)),
        (Some(domain), None, None) => lines.push(format!("certificate:   none for {}", domain)),
        (Some(domain), Some(cert), None) => {
            let state = if status.expired == Some(true) {
                "EXPIRED".to_string()
            } else {
                format!("{} days remaining", status.days_remaining.unwrap_or_default())
            };
            lines.push(format!(
                "certificate:   {} expires {} ({})",
                domain,
                cert.not_after.format("%Y-%m-%d %H:%M UTC"),
                state
            ));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OrchestratorError;
    use crate::orchestrator::Stage;
    use crate::run::Workflow;
    use certpilot_common::RunId;
    use std::path::PathBuf;
    use std::time::Duration;

    fn report(outcome: RunOutcome, logs: &[&str]) -> RunReport {
        RunReport {
            run_id: RunId::from_string("0f8b1c2d-6a7e-4f10-9c3b-2d4e5f607182"),
            workflow: Workflow::Validate,
            domain: "nope.example.com".to_string(),
            completed: vec![],
            outcome,
            preflight: None,
            probe: None,
            bundle_before: None,
            bundle: None,
            notes: vec![],
            proxy_logs: logs.iter().map(|l| l.to_string()).collect(),
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn test_failure_report() {
        let report = report(
            RunOutcome::Failed {
                stage: Stage::ValidateDns,
                error: OrchestratorError::DomainUnresolved {
                    domain: "nope.example.com".to_string(),
                    detail: "no A record found".to_string(),
                },
            },
            &[
                "nginx: [notice] signal process started",
                "nginx: [emerg] host not found",
            ],
        );

        insta::assert_snapshot!(render_failure(&report), @r"
        certpilot validate failed at stage validate-dns (run 0f8b1c2d)
        error: domain 'nope.example.com' does not resolve to an IPv4 address (no A record found)
        hint: DNS changes can take up to 48 hours to propagate. Check the A record with `dig +short <domain> A` from another network and retry once it returns this server's address.

        proxy logs (last 2 lines):
          | nginx: [notice] signal process started
          | nginx: [emerg] host not found
        ");
    }

    #[test]
    fn test_degraded_report_without_logs() {
        let mut report = report(
            RunOutcome::Degraded(OrchestratorError::ProxyUnhealthy {
                context: "activating full".to_string(),
                attempts: 30,
                elapsed: Duration::from_secs(60),
            }),
            &[],
        );
        report.workflow = Workflow::Setup;

        let text = render_failure(&report);
        assert!(text.starts_with("certpilot setup degraded"));
        assert!(text.contains("error: proxy not healthy after activating full"));
        assert!(!text.contains("hint:"));
        assert!(text.ends_with("proxy logs: (none)"));
    }

    #[test]
    fn test_summary_of_success() {
        let report = report(RunOutcome::Succeeded, &[]);
        assert_eq!(render_summary(&report), "certpilot validate succeeded in 1.5s (run 0f8b1c2d)");
        assert_eq!(render_failure(&report), render_summary(&report));
    }

    #[test]
    fn test_status_without_certificate() {
        let status = StatusReport {
            domain: Some("example.com".to_string()),
            config_dir: PathBuf::from("/srv/nginx/conf.d"),
            active: "bootstrap".to_string(),
            backup_present: false,
            certificate: None,
            days_remaining: None,
            expired: None,
            certificate_error: None,
        };

        assert_eq!(
            render_status(&status),
            "config dir:    /srv/nginx/conf.d\n\
             active config: bootstrap\n\
             backup:        none\n\
             certificate:   none for example.com"
        );
    }
}
