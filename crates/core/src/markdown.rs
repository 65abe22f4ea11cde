use crate::model::{FixOutcome, SyncReport};

const MAX_LISTED_DECISIONS: usize = 200;

pub fn render_markdown_summary(report: &SyncReport) -> String {
    let mut out = String::new();
    out.push_str("# Catalog Sync Summary\n\n");
    out.push_str(&format!(
        "- Report version: `{}`\n- Generated at: `{}`\n- Run: `{}`\n- Collection: `{}`\n- Trust: `{:?}`\n- Locations checked: {}\n- Path set from cache: `{}`\n- Workers: {}\n- Elapsed: `{} ms`\n\n",
        report.report_version,
        report.generated_at,
        report.run_id,
        report.collection,
        report.trust,
        report.metrics.locations,
        report.metrics.path_set_from_cache,
        report.metrics.jobs,
        report.metrics.elapsed_ms
    ));

    out.push_str("## Fix Options\n\n");
    let options = &report.fix_options;
    out.push_str(&format!(
        "- index_missing: `{}`\n- trash_missing: `{}`\n- update_locations: `{}`\n- trash_archived: {}\n\n",
        options.index_missing,
        options.trash_missing,
        options.update_locations,
        match options.trash_archived {
            Some(hours) => format!("`{hours}h`"),
            None => "`off`".to_string(),
        }
    ));

    out.push_str("## Mismatches\n\n");
    if report.total_mismatches() == 0 {
        out.push_str("Catalog and filesystem agree.\n\n");
    } else {
        out.push_str("| Kind | Count |\n| --- | ---: |\n");
        for count in report.mismatch_counts.iter().filter(|count| count.mismatches > 0) {
            out.push_str(&format!("| `{}` | {} |\n", count.kind, count.mismatches));
        }
        out.push_str(&format!("| **total** | {} |\n\n", report.total_mismatches()));
    }

    out.push_str("## Fix Decisions\n\n");
    if report.decisions.is_empty() {
        out.push_str("No fixes were attempted.\n\n");
    } else {
        let skipped = report
            .decisions
            .iter()
            .filter(|decision| decision.outcome == FixOutcome::Skipped)
            .count();
        out.push_str(&format!(
            "{} applied, {} skipped, {} already in place.\n\n",
            report.applied_count(),
            skipped,
            report.decisions.len() - report.applied_count() - skipped
        ));
        for decision in report.decisions.iter().take(MAX_LISTED_DECISIONS) {
            out.push_str(&format!(
                "- `{}` on `{}` ({}): `{:?}` {}\n",
                decision.action, decision.uri, decision.kind, decision.outcome, decision.rationale
            ));
        }
        if report.decisions.len() > MAX_LISTED_DECISIONS {
            out.push_str(&format!(
                "- ... {} more\n",
                report.decisions.len() - MAX_LISTED_DECISIONS
            ));
        }
        out.push('\n');
    }

    if !report.warnings.is_empty() {
        out.push_str("## Warnings\n\n");
        for warning in &report.warnings {
            out.push_str(&format!("- {}\n", warning));
        }
    }

    out
}
