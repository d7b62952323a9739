use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use super::command::{self, Placeholders};
use crate::patterns::CotsPattern;
use crate::registry::{args_as, Step, StepContext, StepError, StepResult};
use crate::utils::Utils;

/// Parsed from `xfer.params` (a JSON object; empty text means `{}`).
#[derive(Debug, Default, Deserialize)]
struct TransferArgs {
    timeout_secs: Option<u64>,
    /// Appended to the COTS pattern's params for `{Params}`
    params: Option<String>,
}

/// Terminal step: hands the file to the COTS product named by the xfer row,
/// aimed at the xfer's partner. The partner's `retry_count` and
/// `retry_wait_secs` govern retries; once they are exhausted the file is
/// quarantined.
///
/// The command comes from the COTS pattern's `command_template`, or from
/// `xfer.command` when the template is empty. Placeholders: `{FileName}`,
/// `{BaseName}`, `{Host}`, `{User}`, `{Credentials}`, `{PgpKey}`,
/// `{Service}`, `{Command}`, `{Params}`, `{Correlation}`.
///
/// Args come from `xfer.params`: `timeout_secs` bounds each attempt and
/// `params` is appended to the COTS pattern's params.
pub struct TransferStep;

impl TransferStep {
    fn placeholders(
        path: &Path,
        ctx: &StepContext,
        cots: &CotsPattern,
        args: &TransferArgs,
    ) -> Placeholders {
        let mut placeholders = Placeholders::new()
            .set("FileName", path.to_string_lossy())
            .set("BaseName", Utils::file_name(path))
            .set("Correlation", ctx.correlation.as_str());

        if let Some(xfer) = &ctx.xfer {
            let params = [cots.params.as_str(), args.params.as_deref().unwrap_or_default()]
                .iter()
                .filter(|p| !p.trim().is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            placeholders = placeholders
                .set("Command", xfer.command.as_str())
                .set("Params", params);
        }
        if let Some(partner) = &ctx.partner {
            placeholders = placeholders
                .set("Service", partner.service_name.as_str())
                .set("Host", partner.remote_host.clone().unwrap_or_default())
                .set("User", partner.remote_user.clone().unwrap_or_default())
                .set("Credentials", partner.credentials_ref.clone().unwrap_or_default())
                .set("PgpKey", partner.pgp_key_handle.clone().unwrap_or_default());
        }
        placeholders
    }
}

impl Step for TransferStep {
    fn run(&self, path: &Path, args: &Value, ctx: &StepContext) -> Result<StepResult, StepError> {
        let args: TransferArgs = args_as(args)?;
        let xfer = ctx
            .xfer
            .as_ref()
            .ok_or_else(|| StepError::InvalidArgs("transfer: no xfer bound to this run".into()))?;
        let partner = ctx
            .partner
            .as_ref()
            .ok_or_else(|| StepError::InvalidArgs("transfer: no partner bound to this run".into()))?;

        let conn = ctx.db.get_connection()?;
        let cots = CotsPattern::get_by_id(&conn, xfer.cots_pattern_id)?.ok_or_else(|| {
            StepError::InvalidArgs(format!("transfer: COTS pattern {} missing", xfer.cots_pattern_id))
        })?;
        drop(conn);

        let template = if cots.command_template.trim().is_empty() {
            xfer.command.as_str()
        } else {
            cots.command_template.as_str()
        };
        let argv = command::build_argv(template, &[], &Self::placeholders(path, ctx, &cots, &args));
        let attempts = partner.retry_count.max(0) as u32 + 1;
        let wait = Duration::from_secs(partner.retry_wait_secs.max(0) as u64);

        let mut last = String::new();
        for attempt in 1..=attempts {
            if !path.exists() {
                return Err(StepError::FileVanished(path.to_owned()));
            }
            let outcome = command::run(
                &argv,
                args.timeout_secs.map(Duration::from_secs),
                &ctx.correlation,
            )?;
            if outcome.success() {
                info!(
                    "[{}] Transferred {} to {} via {}",
                    ctx.correlation,
                    Utils::file_name(path),
                    partner.service_name,
                    cots.name
                );
                return Ok(StepResult::proceed(path));
            }
            last = outcome.describe();
            if attempt < attempts {
                warn!(
                    "[{}] Transfer to {} failed ({}), attempt {}/{}; retrying in {:?}",
                    ctx.correlation, partner.service_name, last, attempt, attempts, wait
                );
                thread::sleep(wait);
            }
        }

        Ok(StepResult::quarantine(
            path,
            format!("transfer to {} failed: {}", partner.service_name, last),
        ))
    }
}
