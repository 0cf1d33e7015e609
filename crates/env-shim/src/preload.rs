use ctor::ctor;
use utils::logging;

use crate::export_visible_devices;
use crate::interpose;
use crate::ResolvedView;
use crate::Shim;

#[ctor]
unsafe fn entry_point() {
    logging::init();

    let pid = std::process::id();
    let view = match Shim::from_env() {
        Ok(shim) => shim.resolve_or_deny(pid),
        Err(err) => {
            tracing::error!(pid, "invalid env-shim configuration, hiding all devices: {err}");
            ResolvedView::Denied
        }
    };
    tracing::debug!(pid, ?view, "resolved device view");

    export_visible_devices(&view);
    interpose::install(view);
}
