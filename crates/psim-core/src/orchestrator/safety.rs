//! Final safety gate between reasoning and reply generation.

use super::ReasonOutput;
use crate::knowledge::Policies;
use crate::shared::RiskStatus;

/// Fixed plan line emitted whenever a risk flag is raised.
pub const RISK_PROTOCOL_MESSAGE: &str = "[Риск-триггер: обращение к протоколу]";

#[derive(Debug, Clone, PartialEq)]
pub struct GuardOutcome {
    pub safe_output: ReasonOutput,
    pub risk_status: RiskStatus,
}

/// `none` passes the reasoner output through; any risk flag switches to `acute`, replaces the
/// plan with [`RISK_PROTOCOL_MESSAGE`] and forces tempo `calm`. Works on a copy; a missing
/// output is treated as empty.
pub fn guard(output: Option<&ReasonOutput>, _policies: &Policies, risk_flags: &[String]) -> GuardOutcome {
    let mut safe_output = output.cloned().unwrap_or_default();

    if risk_flags.is_empty() {
        return GuardOutcome {
            safe_output,
            risk_status: RiskStatus::None,
        };
    }

    safe_output.content_plan = vec![RISK_PROTOCOL_MESSAGE.to_string()];
    safe_output.style_directives.tempo = "calm".to_string();
    tracing::warn!(target: "psim::guard", risk_flags = ?risk_flags, "Risk detected; content replaced by protocol message");

    GuardOutcome {
        safe_output,
        risk_status: RiskStatus::Acute,
    }
}
