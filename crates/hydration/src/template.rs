//! Injection templates. The block formats are part of the external
//! contract (clients and tooling parse them), so they are fixed strings,
//! not configuration.

use tinymem_etv::StalenessReport;
use tinymem_store::EntityRow;

/// Fixed token overhead charged per injected block on top of the content
/// estimate (template framing plus message plumbing).
pub const TEMPLATE_OVERHEAD_TOKENS: usize = 48;

/// Character-based token estimate used by the budget merge.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn method_label(method: &str) -> &str {
    match method {
        "ast" => "AST",
        "regex" => "regex",
        "correlation" => "correlation",
        other => other,
    }
}

/// One authoritative entity block.
pub fn entity_block(row: &EntityRow, content: &str) -> String {
    let method = row
        .metadata
        .get("resolution_method")
        .and_then(|v| v.as_str())
        .unwrap_or("ast");
    format!(
        "[CURRENT STATE: AUTHORITATIVE]\nEntity: {}\nArtifact: {}\nSource: Confirmed via {}\n\n{}\n[END CURRENT STATE]\n",
        row.entity_key,
        row.artifact_hash,
        method_label(method),
        content,
    )
}

/// The single divergence notice listing every stale entity.
pub fn divergence_notice(stale: &[StalenessReport]) -> String {
    let mut notice = String::from(
        "[STATE NOTICE: DISK DIVERGENCE DETECTED]\nThe following entities no longer match the on-disk source and were NOT injected:\n",
    );
    for report in stale {
        notice.push_str(&format!("- {} ({})\n", report.entity_key, report.filepath));
    }
    notice.push_str(
        "Resolve by POSTing the current file content to /v1/user/code, or explicitly acknowledge an overwrite.\n[END NOTICE]\n",
    );
    notice
}

/// Warning prepended when the previous episode's output never became state.
pub fn unlinked_notice() -> &'static str {
    "[STATE NOTICE] The previous output could not be structurally linked to a tracked entity; it did not modify authoritative state. [END NOTICE]\n"
}
