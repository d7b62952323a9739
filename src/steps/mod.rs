//! Standard workflow steps

mod av_scan;
pub mod command;
mod exit;
mod file_ops;
mod transfer;
mod transform;

pub use av_scan::AvScanStep;
pub use exit::ExitStep;
pub use file_ops::{CopyStep, MoveStep, RenameStep};
pub use transfer::TransferStep;
pub use transform::{Case, CaseStep, LineEnd, LineEndStep};

use crate::registry::StepRegistry;

/// Registry key of the terminal transfer step run once per xfer row
pub const TRANSFER_STEP: &str = "transfer";

pub fn register_defaults(registry: &mut StepRegistry) {
    registry
        .register_step("case.lower", CaseStep(Case::Lower))
        .register_step("case.upper", CaseStep(Case::Upper))
        .register_step("line_end.dos2unix", LineEndStep(LineEnd::Unix))
        .register_step("line_end.unix2dos", LineEndStep(LineEnd::Dos))
        .register_step("copy", CopyStep)
        .register_step("move", MoveStep)
        .register_step("rename", RenameStep)
        .register_step("exit", ExitStep)
        .register_step("av.scan", AvScanStep)
        .register_step(TRANSFER_STEP, TransferStep);
}

#[cfg(test)]
pub mod test_support {
    use tempfile::TempDir;

    use crate::db::test_support::scratch_db;
    use crate::registry::StepContext;

    /// A step context over a scratch store. Working directories point into
    /// the store's temporary directory.
    pub fn context() -> (TempDir, StepContext) {
        let (dir, db) = scratch_db();
        let ctx = StepContext {
            correlation: "test".into(),
            route_id: 1,
            transient_dir: dir.path().join("transient"),
            outbound_dir: dir.path().join("outbound"),
            error_dir: dir.path().join("error"),
            partner: None,
            xfer: None,
            db,
        };
        (dir, ctx)
    }
}
