use serde_json::json;

use crate::cli::utils::{output_success, SETTLE_TIMEOUT};
use crate::cli::OutputFormat;
use crate::guard::{GuardDecision, Route};
use crate::hub::Hub;

pub async fn handle(path: String, admin: bool, hub: &Hub, output_format: OutputFormat) -> anyhow::Result<()> {
    let route = if admin { Route::privileged(&path) } else { Route::protected(&path) };
    let mut watch = hub.guard_route(route);

    let decision = match tokio::time::timeout(SETTLE_TIMEOUT, watch.wait_until(GuardDecision::is_settled)).await {
        Ok(Some(decision)) => decision,
        _ => watch.decision(),
    };

    let message = match &decision {
        GuardDecision::Resolving => format!("{}: still resolving", path),
        GuardDecision::Granted => format!("{}: granted", path),
        GuardDecision::Unauthenticated { return_to, .. } => {
            format!("{}: sign in first ({})", path, hub.guard.sign_in_location(return_to))
        }
        GuardDecision::Forbidden { redirect } => format!("{}: forbidden, redirect to {}", path, redirect),
    };
    output_success(&output_format, &message, Some(json!({ "route": path, "decision": decision })))
}
