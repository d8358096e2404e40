mod main;
mod provision;
mod reconcile;

pub use main::*;
pub use provision::{adopt_identity, drifted, ensure_object, Applied, ProvisionReport, Provisioner};
pub use reconcile::{Outcome, Reconciler, RECREATE_REQUEUE, WRONG_NAMESPACED_NAME};
